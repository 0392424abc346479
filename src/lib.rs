pub mod analysis;
pub mod comfy_table;
pub mod indicators;
pub mod market_data;
pub mod ranking;
pub mod report;
pub mod scoring;
pub mod storage_utils;
pub mod tui;
