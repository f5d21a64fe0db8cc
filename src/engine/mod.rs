pub mod pool;
pub mod scanner;
pub mod sweeper;
pub mod transport;
pub mod uploader;
pub mod watcher;
pub mod worker;
