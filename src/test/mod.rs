pub mod utils;

pub use utils::test_db;

mod db;
mod grading;
mod sessions;
