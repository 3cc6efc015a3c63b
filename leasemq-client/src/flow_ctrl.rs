//! Coordinator-pushed flow-control rules
//!
//! Rule sets arrive as JSON arrays of `{"type": n, "rule": [...]}` groups:
//!
//! - type 0, data limit: `{"start":"HH:MM","end":"HH:MM","dltInM":n,"limitInM":n,"freqInMs":n}`
//! - type 1, frequency limit: `{"zeroCnt":n,"freqInMs":n}`
//! - type 3, filter frequency: `{"normFreqInMs":n,"filterFreqInMs":n,"minDataFilterFreqInMs":n}`
//!
//! Unknown rule types are ignored. The default and the group rule set are
//! versioned independently; group rules win over default rules per type.

use chrono::Timelike;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::error::LeasemqClientError;
use crate::protocol::ConsumeData;

const MIB: i64 = 1024 * 1024;

/// Rule-set id meaning "never received"
pub const NO_RULE_SET: i64 = -2;

const RULE_TYPE_DATA_LIMIT: i32 = 0;
const RULE_TYPE_FREQ_LIMIT: i32 = 1;
const RULE_TYPE_FILTER_FREQ: i32 = 3;

#[derive(Debug, Deserialize)]
struct RuleGroup {
    #[serde(rename = "type")]
    kind: i32,
    #[serde(default)]
    rule: Vec<serde_json::Value>,
}

/// Throttle reads while the backlog is large inside a time window
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataLimitRule {
    /// Window start, minutes since midnight (local time)
    #[serde(rename = "start", deserialize_with = "minute_of_day")]
    pub start_minute: u32,
    #[serde(rename = "end", deserialize_with = "minute_of_day")]
    pub end_minute: u32,
    /// Backlog delta threshold in MiB
    pub dlt_in_m: i64,
    /// Fetched-size threshold in MiB
    pub limit_in_m: i64,
    pub freq_in_ms: u64,
}

impl DataLimitRule {
    fn in_window(&self, minute: u32) -> bool {
        if self.start_minute <= self.end_minute {
            (self.start_minute..=self.end_minute).contains(&minute)
        } else {
            // window wraps midnight
            minute >= self.start_minute || minute <= self.end_minute
        }
    }

    fn applies(&self, minute: u32, data_dlt: i64, msg_size: u64) -> bool {
        self.in_window(minute)
            && data_dlt >= self.dlt_in_m.saturating_mul(MIB)
            && msg_size as i64 >= self.limit_in_m.saturating_mul(MIB)
    }
}

/// Back off after a run of empty fetches
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FreqLimitRule {
    pub zero_cnt: u32,
    pub freq_in_ms: u64,
}

/// Minimum interval between fetches by filtering mode
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterFreqRule {
    #[serde(default)]
    pub norm_freq_in_ms: u64,
    #[serde(default)]
    pub filter_freq_in_ms: u64,
    #[serde(default)]
    pub min_data_filter_freq_in_ms: u64,
}

fn minute_of_day<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_hhmm(&raw).ok_or_else(|| {
        serde::de::Error::custom(format!("invalid HH:MM time value '{}'", raw))
    })
}

fn parse_hhmm(raw: &str) -> Option<u32> {
    let (hours, minutes) = raw.trim().split_once(':')?;
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    // 24:00 is accepted as end of day
    if hours > 24 || minutes > 59 || (hours == 24 && minutes != 0) {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// One parsed rule set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowCtrlRuleSet {
    pub data_limits: Vec<DataLimitRule>,
    /// Sorted by ascending `zero_cnt`
    pub freq_limits: Vec<FreqLimitRule>,
    pub filter_freq: Option<FilterFreqRule>,
}

impl FlowCtrlRuleSet {
    /// Parse a rule-set payload; an empty payload is an empty rule set
    pub fn parse(json: &str) -> Result<Self, LeasemqClientError> {
        let mut set = FlowCtrlRuleSet::default();
        if json.trim().is_empty() {
            return Ok(set);
        }

        let groups: Vec<RuleGroup> = serde_json::from_str(json)?;
        for group in groups {
            match group.kind {
                RULE_TYPE_DATA_LIMIT => {
                    for rule in group.rule {
                        set.data_limits.push(serde_json::from_value(rule)?);
                    }
                }
                RULE_TYPE_FREQ_LIMIT => {
                    for rule in group.rule {
                        set.freq_limits.push(serde_json::from_value(rule)?);
                    }
                }
                RULE_TYPE_FILTER_FREQ => {
                    if let Some(rule) = group.rule.into_iter().next() {
                        set.filter_freq = Some(serde_json::from_value(rule)?);
                    }
                }
                other => debug!(rule_type = other, "Ignoring unknown flow control rule type"),
            }
        }
        set.freq_limits.sort_by_key(|rule| rule.zero_cnt);
        Ok(set)
    }
}

/// Holds the default and group rule sets and computes release waits
#[derive(Debug, Clone)]
pub struct FlowCtrlRuleHandler {
    def_id: i64,
    def_rules: FlowCtrlRuleSet,
    group_id: i64,
    group_rules: FlowCtrlRuleSet,
    qry_priority_id: i32,
}

impl Default for FlowCtrlRuleHandler {
    fn default() -> Self {
        Self {
            def_id: NO_RULE_SET,
            def_rules: FlowCtrlRuleSet::default(),
            group_id: NO_RULE_SET,
            group_rules: FlowCtrlRuleSet::default(),
            qry_priority_id: 0,
        }
    }
}

impl FlowCtrlRuleHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_rule_id(&self) -> i64 {
        self.def_id
    }

    pub fn group_rule_id(&self) -> i64 {
        self.group_id
    }

    pub fn qry_priority_id(&self) -> i32 {
        self.qry_priority_id
    }

    /// Apply a default rule set; returns false when `id` is unchanged
    pub fn update_default(&mut self, id: i64, json: &str) -> Result<bool, LeasemqClientError> {
        if id == self.def_id {
            return Ok(false);
        }
        self.def_rules = FlowCtrlRuleSet::parse(json)?;
        info!(old_id = self.def_id, new_id = id, "Updated default flow control rules");
        self.def_id = id;
        Ok(true)
    }

    /// Apply a group rule set; the query priority is stored regardless
    pub fn update_group(
        &mut self,
        qry_priority_id: i32,
        id: i64,
        json: &str,
    ) -> Result<bool, LeasemqClientError> {
        self.qry_priority_id = qry_priority_id;
        if id == self.group_id {
            return Ok(false);
        }
        self.group_rules = FlowCtrlRuleSet::parse(json)?;
        info!(old_id = self.group_id, new_id = id, "Updated group flow control rules");
        self.group_id = id;
        Ok(true)
    }

    fn data_limits(&self) -> &[DataLimitRule] {
        if self.group_rules.data_limits.is_empty() {
            &self.def_rules.data_limits
        } else {
            &self.group_rules.data_limits
        }
    }

    fn freq_limits(&self) -> &[FreqLimitRule] {
        if self.group_rules.freq_limits.is_empty() {
            &self.def_rules.freq_limits
        } else {
            &self.group_rules.freq_limits
        }
    }

    fn filter_freq(&self) -> Option<&FilterFreqRule> {
        self.group_rules
            .filter_freq
            .as_ref()
            .or(self.def_rules.filter_freq.as_ref())
    }

    /// Wait imposed by data-limit rules for the local time of day
    pub fn data_limit_wait(&self, data: &ConsumeData, minute: u32) -> u64 {
        if data.esc_flow_ctrl || data.cur_data_dlt < 0 {
            return 0;
        }
        self.data_limits()
            .iter()
            .filter(|rule| rule.applies(minute, data.cur_data_dlt, data.msg_size))
            .map(|rule| rule.freq_in_ms)
            .max()
            .unwrap_or(0)
    }

    /// Wait after `zero_cnt` consecutive empty fetches
    pub fn zero_fetch_wait(&self, zero_cnt: u32) -> u64 {
        if zero_cnt == 0 {
            return 0;
        }
        self.freq_limits()
            .iter()
            .rev()
            .find(|rule| zero_cnt >= rule.zero_cnt)
            .map_or(0, |rule| rule.freq_in_ms)
    }

    /// Minimum interval between fetches for the filtering mode
    pub fn filter_wait(&self, filtered: bool, msg_size: u64) -> u64 {
        match self.filter_freq() {
            None => 0,
            Some(rule) if !filtered => rule.norm_freq_in_ms,
            Some(rule) if msg_size == 0 => rule.min_data_filter_freq_in_ms,
            Some(rule) => rule.filter_freq_in_ms,
        }
    }

    /// Next-eligibility delay for a partition released after `data`
    pub fn consume_wait(
        &self,
        data: &ConsumeData,
        filtered: bool,
        zero_cnt: u32,
        slow_consume_wait_ms: u64,
    ) -> u64 {
        let minute = chrono::Local::now().num_seconds_from_midnight() / 60;
        self.consume_wait_at(data, filtered, zero_cnt, slow_consume_wait_ms, minute)
    }

    pub(crate) fn consume_wait_at(
        &self,
        data: &ConsumeData,
        filtered: bool,
        zero_cnt: u32,
        slow_consume_wait_ms: u64,
        minute: u32,
    ) -> u64 {
        let slow = if data.require_slow {
            slow_consume_wait_ms
        } else {
            0
        };
        [
            data.dlt_limit_ms,
            self.data_limit_wait(data, minute),
            self.zero_fetch_wait(zero_cnt),
            self.filter_wait(filtered, data.msg_size),
            slow,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    const RULES: &str = r#"[
        {"type":0,"rule":[{"start":"08:00","end":"17:59","dltInM":1024,"limitInM":20,"freqInMs":1000}]},
        {"type":1,"rule":[{"zeroCnt":3,"freqInMs":300},{"zeroCnt":8,"freqInMs":1000},{"zeroCnt":5,"freqInMs":500}]},
        {"type":3,"rule":[{"normFreqInMs":0,"filterFreqInMs":100,"minDataFilterFreqInMs":400}]},
        {"type":2,"rule":[{"anything":true}]}
    ]"#;

    fn success_data(msg_size: u64, cur_data_dlt: i64) -> ConsumeData {
        ConsumeData::success(0, false, msg_size, cur_data_dlt, false)
    }

    #[test]
    fn test_parse_rule_set() {
        let set = FlowCtrlRuleSet::parse(RULES).unwrap();
        assert_eq!(set.data_limits.len(), 1);
        assert_eq!(set.data_limits[0].start_minute, 8 * 60);
        assert_eq!(set.data_limits[0].end_minute, 17 * 60 + 59);
        let zero_cnts: Vec<u32> = set.freq_limits.iter().map(|r| r.zero_cnt).collect();
        assert_eq!(zero_cnts, vec![3, 5, 8]);
        assert_eq!(set.filter_freq.unwrap().min_data_filter_freq_in_ms, 400);
    }

    #[test]
    fn test_parse_errors() {
        assert!(FlowCtrlRuleSet::parse("not json").is_err());
        assert!(FlowCtrlRuleSet::parse(
            r#"[{"type":0,"rule":[{"start":"25:00","end":"26:00","dltInM":1,"limitInM":1,"freqInMs":1}]}]"#
        )
        .is_err());
        assert_eq!(FlowCtrlRuleSet::parse("").unwrap(), FlowCtrlRuleSet::default());
    }

    #[test]
    fn test_versioned_updates() {
        let mut handler = FlowCtrlRuleHandler::new();
        assert!(handler.update_default(10, RULES).unwrap());
        assert!(!handler.update_default(10, "garbage is not parsed").unwrap());
        assert_eq!(handler.default_rule_id(), 10);

        assert!(handler.update_default(11, "garbage").is_err());
        assert_eq!(handler.default_rule_id(), 10);
        assert_eq!(handler.zero_fetch_wait(3), 300);
    }

    #[test]
    fn test_group_rules_take_precedence() {
        let mut handler = FlowCtrlRuleHandler::new();
        handler.update_default(1, RULES).unwrap();
        handler
            .update_group(7, 2, r#"[{"type":1,"rule":[{"zeroCnt":1,"freqInMs":50}]}]"#)
            .unwrap();
        assert_eq!(handler.qry_priority_id(), 7);
        assert_eq!(handler.zero_fetch_wait(9), 50);
        // types absent from the group set still come from the default set
        assert_eq!(handler.filter_wait(true, 10), 100);
    }

    #[test]
    fn test_zero_fetch_wait() {
        let mut handler = FlowCtrlRuleHandler::new();
        handler.update_default(1, RULES).unwrap();
        assert_eq!(handler.zero_fetch_wait(0), 0);
        assert_eq!(handler.zero_fetch_wait(2), 0);
        assert_eq!(handler.zero_fetch_wait(4), 300);
        assert_eq!(handler.zero_fetch_wait(6), 500);
        assert_eq!(handler.zero_fetch_wait(100), 1000);
    }

    #[test]
    fn test_data_limit_window() {
        let mut handler = FlowCtrlRuleHandler::new();
        handler.update_default(1, RULES).unwrap();
        let big = success_data(32 * MIB as u64, 2048 * MIB);

        assert_eq!(handler.data_limit_wait(&big, 9 * 60), 1000);
        assert_eq!(handler.data_limit_wait(&big, 20 * 60), 0);
        assert_eq!(handler.data_limit_wait(&success_data(1, 2048 * MIB), 9 * 60), 0);

        let mut escaped = big.clone();
        escaped.esc_flow_ctrl = true;
        assert_eq!(handler.data_limit_wait(&escaped, 9 * 60), 0);
    }

    #[test]
    fn test_wrapping_window() {
        let rule = DataLimitRule {
            start_minute: 22 * 60,
            end_minute: 2 * 60,
            dlt_in_m: 0,
            limit_in_m: 0,
            freq_in_ms: 10,
        };
        assert!(rule.in_window(23 * 60));
        assert!(rule.in_window(60));
        assert!(!rule.in_window(12 * 60));
    }

    #[test]
    fn test_consume_wait_takes_maximum() {
        let handler = FlowCtrlRuleHandler::new();
        let throttled = ConsumeData::throttled(0, ErrorCode::ConsumeSpeedLimit, 500, false);
        assert_eq!(handler.consume_wait_at(&throttled, false, 0, 700, 0), 500);

        let slow = ConsumeData::throttled(0, ErrorCode::ConsumeSpeedLimit, 500, true);
        assert_eq!(handler.consume_wait_at(&slow, false, 0, 700, 0), 700);

        assert_eq!(handler.consume_wait_at(&success_data(10, 0), false, 0, 700, 0), 0);
    }
}
