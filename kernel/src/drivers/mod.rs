//! Device drivers: synchronous layers over the asynchronous devices.

pub mod acia;
pub mod console;
pub mod disk;

pub use acia::DriverAcia;
pub use console::DriverConsole;
pub use disk::DriverDisk;
