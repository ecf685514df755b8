use serde::{Deserialize, Serialize};

use super::event::Event;
use super::price::PriceConfig;
use super::settings::Settings;

/// The main data container. Everything in here gets serialized into a
/// snapshot file: the event log, the price history and user settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    /// All events, oldest first
    pub events: Vec<Event>,

    /// Price configs, ascending by effective date
    pub prices: Vec<PriceConfig>,

    pub settings: Settings,
}
