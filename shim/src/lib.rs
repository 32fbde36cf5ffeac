pub mod events;
pub mod filesystem;
pub mod io;
pub mod managed_process;
pub mod protocols;
pub mod reaper;
pub mod shim;
pub mod task_service;

pub use shim::Shim;
pub use task_service::TaskService;
