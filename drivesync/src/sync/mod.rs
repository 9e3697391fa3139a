pub mod engine;
pub mod gateway;
pub mod paths;
pub mod retry;
pub mod scanner;
pub mod state;
pub mod verify;
