//! Canonical category filters over the full filtered universe.
//!
//! Used when a per-category snapshot key is missing from Redis: the engine
//! falls back to `scanner:filtered_complete:LAST` and derives the category
//! deterministically. Broadcast categories stay consistent with these
//! definitions. Rows are relayed verbatim, so they stay dynamic JSON here;
//! only the filter keys are read.

use serde_json::Value;

const DEFAULT_LIMIT: usize = 100;

#[derive(Clone, Copy)]
enum Direction {
    Asc,
    Desc,
}

/// Derives the rows of `category` from the full universe.
pub fn apply(category: &str, rows: &[Value]) -> Vec<Value> {
    match category {
        "gappers_up" => rank(rows, |r| num(r, "gap") > 0.0, |r| num(r, "gap"), Direction::Desc),
        "gappers_down" => rank(rows, |r| num(r, "gap") < 0.0, |r| num(r, "gap"), Direction::Asc),
        "momentum_up" => rank(rows, |_| true, |r| num(r, "change"), Direction::Desc),
        "momentum_down" => rank(rows, |_| true, |r| num(r, "change"), Direction::Asc),
        "winners" => rank(rows, |r| num(r, "change") > 5.0, |r| num(r, "change"), Direction::Desc),
        "losers" => rank(rows, |r| num(r, "change") < -5.0, |r| num(r, "change"), Direction::Asc),
        "high_volume" => rank(rows, |r| num(r, "rvol") > 2.0, |r| num(r, "rvol"), Direction::Desc),
        "new_highs" => rank(
            rows,
            |r| num(r, "high") > 0.0 && num(r, "price") >= num(r, "high") * 0.99,
            |r| num(r, "price") / num(r, "high"),
            Direction::Desc,
        ),
        "new_lows" => rank(
            rows,
            |r| num(r, "low") > 0.0 && num(r, "price") <= num(r, "low") * 1.01,
            |r| num(r, "price") / num(r, "low"),
            Direction::Asc,
        ),
        "anomalies" => rank(
            rows,
            |r| num(r, "rvol") > 5.0 || num(r, "change").abs() > 10.0,
            |r| num(r, "rvol"),
            Direction::Desc,
        ),
        "reversals" => rank(rows, |r| pullback(r) > 0.05, pullback, Direction::Desc),
        _ => rank(rows, |_| true, |r| num(r, "score"), Direction::Desc),
    }
}

fn rank<P, K>(rows: &[Value], predicate: P, key: K, direction: Direction) -> Vec<Value>
where
    P: Fn(&Value) -> bool,
    K: Fn(&Value) -> f64,
{
    let mut selected: Vec<(f64, &Value)> = rows
        .iter()
        .filter(|r| predicate(r))
        .map(|r| (key(r), r))
        .collect();
    selected.sort_by(|a, b| {
        let ord = a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal);
        match direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });
    selected
        .into_iter()
        .take(DEFAULT_LIMIT)
        .map(|(_, r)| r.clone())
        .collect()
}

fn num(row: &Value, key: &str) -> f64 {
    row.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Fraction pulled back from the intraday extreme, whichever side is larger.
fn pullback(row: &Value) -> f64 {
    let price = num(row, "price");
    let high = num(row, "high");
    let low = num(row, "low");
    let from_high = if high > 0.0 { (high - price) / high } else { 0.0 };
    let from_low = if low > 0.0 { (price - low) / low } else { 0.0 };
    from_high.max(from_low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(symbol: &str, fields: Value) -> Value {
        let mut row = json!({ "symbol": symbol });
        if let (Some(obj), Some(extra)) = (row.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        row
    }

    fn symbols(rows: &[Value]) -> Vec<&str> {
        rows.iter()
            .filter_map(|r| r.get("symbol").and_then(Value::as_str))
            .collect()
    }

    #[test]
    fn gappers_split_by_sign_and_sort_by_magnitude() {
        let universe = vec![
            row("A", json!({"gap": 2.0})),
            row("B", json!({"gap": -3.0})),
            row("C", json!({"gap": 7.5})),
            row("D", json!({"gap": 0.0})),
            row("E", json!({"gap": -1.0})),
        ];
        assert_eq!(symbols(&apply("gappers_up", &universe)), vec!["C", "A"]);
        assert_eq!(symbols(&apply("gappers_down", &universe)), vec!["B", "E"]);
    }

    #[test]
    fn winners_and_losers_use_five_percent_cutoffs() {
        let universe = vec![
            row("A", json!({"change": 6.0})),
            row("B", json!({"change": 4.9})),
            row("C", json!({"change": 12.0})),
            row("D", json!({"change": -5.5})),
            row("E", json!({"change": -2.0})),
        ];
        assert_eq!(symbols(&apply("winners", &universe)), vec!["C", "A"]);
        assert_eq!(symbols(&apply("losers", &universe)), vec!["D"]);
    }

    #[test]
    fn high_volume_requires_double_relative_volume() {
        let universe = vec![
            row("A", json!({"rvol": 2.5})),
            row("B", json!({"rvol": 1.9})),
            row("C", json!({"rvol": 9.0})),
        ];
        assert_eq!(symbols(&apply("high_volume", &universe)), vec!["C", "A"]);
    }

    #[test]
    fn new_highs_within_one_percent_of_high() {
        let universe = vec![
            row("A", json!({"price": 99.5, "high": 100.0})),
            row("B", json!({"price": 97.0, "high": 100.0})),
            row("C", json!({"price": 100.0, "high": 100.0})),
        ];
        // C touches the high exactly, A sits just inside the band, B is out.
        assert_eq!(symbols(&apply("new_highs", &universe)), vec!["C", "A"]);
    }

    #[test]
    fn anomalies_trigger_on_either_condition() {
        let universe = vec![
            row("A", json!({"rvol": 6.0, "change": 1.0})),
            row("B", json!({"rvol": 1.0, "change": -11.0})),
            row("C", json!({"rvol": 1.0, "change": 3.0})),
        ];
        let result = apply("anomalies", &universe);
        let mut found = symbols(&result);
        found.sort();
        assert_eq!(found, vec!["A", "B"]);
    }

    #[test]
    fn reversals_need_five_percent_pullback() {
        let universe = vec![
            // Ran to 100, now 90: 10% off the high.
            row("A", json!({"price": 90.0, "high": 100.0, "low": 85.0})),
            // Bounced from 80 to 90: 12.5% off the low.
            row("B", json!({"price": 90.0, "high": 91.0, "low": 80.0})),
            // Flat.
            row("C", json!({"price": 100.0, "high": 101.0, "low": 99.5})),
        ];
        let result = apply("reversals", &universe);
        assert_eq!(symbols(&result), vec!["B", "A"]);
    }

    #[test]
    fn unknown_category_takes_top_by_score() {
        let universe = vec![
            row("A", json!({"score": 10.0})),
            row("B", json!({"score": 30.0})),
            row("C", json!({"score": 20.0})),
        ];
        assert_eq!(symbols(&apply("mystery", &universe)), vec!["B", "C", "A"]);
    }

    #[test]
    fn results_cap_at_one_hundred_rows() {
        let universe: Vec<Value> = (0..250)
            .map(|i| row(&format!("S{}", i), json!({"change": i as f64})))
            .collect();
        assert_eq!(apply("momentum_up", &universe).len(), 100);
    }
}
