use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File name of the identity marker inside every vault.
pub const IDENTITY_FILE_NAME: &str = "anchor_identity.json";
/// Older releases wrote the marker as a dotfile; still accepted when reading.
pub const LEGACY_IDENTITY_FILE_NAME: &str = ".anchor_identity.json";

/// Plaintext the verification token must decrypt to under the vault key.
pub const VERIFICATION_PLAINTEXT: &[u8] = b"ANCHOR_VERIFY";

/// Per-vault marker document.
///
/// Stored exactly once per vault, never encrypted, never deleted by a
/// prefix wipe. `vault_id` is stable for the life of the vault. When `salt`
/// is present the vault is encrypted and `verification_token` holds
/// [`VERIFICATION_PLAINTEXT`] sealed under the password-derived key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultIdentity {
    pub vault_id: Uuid,
    #[serde(with = "hex_opt")]
    pub salt: Option<[u8; 32]>,
    #[serde(with = "hex_opt_vec")]
    pub verification_token: Option<Vec<u8>>,
}

impl VaultIdentity {
    /// A fresh identity for an unencrypted vault.
    #[must_use]
    pub fn unencrypted() -> Self {
        Self { vault_id: Uuid::new_v4(), salt: None, verification_token: None }
    }

    /// A fresh identity for an encrypted vault.
    #[must_use]
    pub fn encrypted(salt: [u8; 32], verification_token: Vec<u8>) -> Self {
        Self { vault_id: Uuid::new_v4(), salt: Some(salt), verification_token: Some(verification_token) }
    }

    #[must_use]
    pub const fn is_encrypted(&self) -> bool {
        self.salt.is_some()
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Option<[u8; 32]>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_some(&hex::encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<[u8; 32]>, D::Error> {
        let value: Option<String> = Option::deserialize(de)?;
        match value {
            None => Ok(None),
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] =
                    bytes.try_into().map_err(|_| serde::de::Error::custom("salt must be 32 bytes"))?;
                Ok(Some(arr))
            }
        }
    }
}

mod hex_opt_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_some(&hex::encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(de)?;
        value.map(|s| hex::decode(&s).map_err(serde::de::Error::custom)).transpose()
    }
}
