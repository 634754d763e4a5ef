pub mod barrier_batcher;
pub mod binding_layout;
pub mod command_batch;
pub mod command_context;
pub mod descriptor_cache;
pub mod frame_counter;
pub mod init_log;
pub mod ray_tracing;
pub mod transient_uploader;
