pub mod db;
pub mod migrations;
pub mod utils;
pub mod validation;
