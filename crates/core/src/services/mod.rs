pub mod aggregation_service;
pub mod cache_service;
pub mod comparison_service;
pub mod event_store;
pub mod streak_service;
