//! Rule lists bundled with the library

use crate::content_blocker::{rules_from_filter_text, rules_from_json};
use crate::error::ShieldsError;
use serde_json::Value;
use shields_types::{BlocklistType, GenericBlocklistType};

/// A bundled asset, either filter text or ready-made rules
#[derive(Debug, Clone, Copy)]
pub enum BundledAsset {
    FilterText(&'static str),
    Rules(&'static str),
}

pub fn bundled_asset(generic_type: GenericBlocklistType) -> BundledAsset {
    match generic_type {
        GenericBlocklistType::BlockAds => {
            BundledAsset::FilterText(include_str!("../../assets/block-ads.txt"))
        }
        GenericBlocklistType::BlockTrackers => {
            BundledAsset::FilterText(include_str!("../../assets/block-trackers.txt"))
        }
        GenericBlocklistType::BlockCookies => {
            BundledAsset::Rules(include_str!("../../assets/block-cookies.json"))
        }
        GenericBlocklistType::UpgradeMixedContent => {
            BundledAsset::Rules(include_str!("../../assets/upgrade-mixed-content.json"))
        }
    }
}

/// The content-blocker rules of a bundled blocklist
pub fn bundled_rules(generic_type: GenericBlocklistType) -> Result<Vec<Value>, ShieldsError> {
    let target = BlocklistType::Generic(generic_type).identifier();
    match bundled_asset(generic_type) {
        BundledAsset::FilterText(text) => rules_from_filter_text(&target, text),
        BundledAsset::Rules(text) => rules_from_json(&target, text),
    }
}
