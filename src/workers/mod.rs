pub mod integrity_auditor;

pub use integrity_auditor::IntegrityAuditor;
