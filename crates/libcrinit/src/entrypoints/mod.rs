mod init_manager;

pub use init_manager::{load_task_db, run_init};
