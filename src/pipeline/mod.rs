pub mod worker;

pub use worker::DecodeWorker;
