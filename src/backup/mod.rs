pub(crate) mod db_dump; // pg_dump invocation
pub(crate) mod naming;
pub(crate) mod object_store; // S3-compatible artifact storage
pub(crate) mod run_lock;
pub(crate) mod service;

pub use service::BackupService;
