pub mod event;
pub mod export;
pub mod ledger;
pub mod period;
pub mod price;
pub mod settings;
pub mod stats;
