pub mod shutdown_handler;
pub mod sqs;
pub mod task_monitor;
