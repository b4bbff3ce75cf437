pub mod alerts;
pub mod ledger;
pub mod photos;
pub mod source;
pub mod vault;
