//! Generation records produced by the simulation service, and the summaries
//! the front ends plot from them.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoldHolding {
    #[serde(default)]
    pub purchase_time: i64,
    #[serde(default)]
    pub sell_time: i64,
    #[serde(default)]
    pub win: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePoint {
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bot {
    #[serde(default)]
    pub fitness: f64,
    #[serde(default)]
    pub money: f64,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub sold_holdings: Vec<SoldHolding>,
    #[serde(default)]
    pub value_history: Vec<ValuePoint>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub Vec<Bot>);

/// Immutable, shared sequence of generations. Appending copies pointers only.
pub type GenerationLog = Arc<Vec<Arc<Generation>>>;

impl Generation {
    pub fn bots(&self) -> &[Bot] {
        &self.0
    }

    pub fn average_fitness(&self) -> Option<f64> {
        average(self.0.iter().map(|b| b.fitness))
    }

    pub fn average_money(&self) -> Option<f64> {
        average(self.0.iter().map(|b| b.money))
    }

    pub fn best(&self) -> Option<&Bot> {
        self.0.iter().fold(None, fitter)
    }
}

impl Bot {
    /// `(unix seconds, value)` points of the bot's portfolio value.
    pub fn value_series(&self) -> Vec<(f64, f64)> {
        self.value_history
            .iter()
            .map(|p| (p.time as f64, p.value))
            .collect()
    }
}

/// Later bot wins unless the earlier one is strictly fitter.
fn fitter<'a>(best: Option<&'a Bot>, bot: &'a Bot) -> Option<&'a Bot> {
    match best {
        Some(b) if b.fitness > bot.fitness => Some(b),
        _ => Some(bot),
    }
}

fn average(xs: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = xs.fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// `(generation number, average fitness)`, numbered from 1.
pub fn average_fitness_series(generations: &[Arc<Generation>]) -> Vec<(f64, f64)> {
    generations
        .iter()
        .enumerate()
        .filter_map(|(i, g)| g.average_fitness().map(|v| ((i + 1) as f64, v)))
        .collect()
}

/// `(generation index, average money)`, numbered from 0.
pub fn average_money_series(generations: &[Arc<Generation>]) -> Vec<(f64, f64)> {
    generations
        .iter()
        .enumerate()
        .filter_map(|(i, g)| g.average_money().map(|v| (i as f64, v)))
        .collect()
}

/// Highest-fitness bot across every generation; later bots win ties.
pub fn best_bot(generations: &[Arc<Generation>]) -> Option<&Bot> {
    generations
        .iter()
        .filter_map(|g| g.best())
        .fold(None, fitter)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthActivity {
    pub month: String,
    pub buys: usize,
    pub sells: usize,
    pub wins: usize,
    pub losses: usize,
}

fn month_of(ts: i64) -> Option<NaiveDate> {
    let dt = DateTime::<Utc>::from_timestamp(ts, 0)?;
    NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)
}

/// UTC calendar day of a unix timestamp (`YYYY-MM-DD`).
pub fn day_label(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn next_month(d: NaiveDate) -> Option<NaiveDate> {
    if d.month() == 12 {
        NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
    }
}

/// Month-by-month trade activity between the bot's start and end time (UTC).
pub fn purchase_history(bot: &Bot) -> Vec<MonthActivity> {
    let (Some(start), Some(end)) = (
        bot.start_time.and_then(month_of),
        bot.end_time.and_then(month_of),
    ) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let mut cur = start;
    while cur <= end {
        let buys = bot
            .sold_holdings
            .iter()
            .filter(|h| month_of(h.purchase_time) == Some(cur))
            .count();
        let sells: Vec<&SoldHolding> = bot
            .sold_holdings
            .iter()
            .filter(|h| month_of(h.sell_time) == Some(cur))
            .collect();
        let wins = sells.iter().filter(|h| h.win).count();
        out.push(MonthActivity {
            month: cur.format("%Y-%m").to_string(),
            buys,
            sells: sells.len(),
            wins,
            losses: sells.len() - wins,
        });
        let Some(next) = next_month(cur) else {
            break;
        };
        cur = next;
    }
    out
}
