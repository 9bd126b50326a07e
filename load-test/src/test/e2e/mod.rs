pub mod runtime;

mod test_distributed;
mod test_standalone;
