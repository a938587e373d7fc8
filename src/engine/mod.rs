pub mod bet_manager;
pub mod keeper;
pub mod position;
pub mod risk;
pub mod scorer;
pub mod settlement;
