#![allow(dead_code)]

pub mod backend;
pub mod upstream;

use chrono::{DateTime, Utc};

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("valid RFC 3339 timestamp")
        .with_timezone(&Utc)
}
