/// Exponential Moving Average of the full `data` slice, seeded with the SMA
/// of the first `period` values.
pub fn ema(data: &[f64], period: usize) -> f64 {
    if data.is_empty() || period == 0 {
        return 0.0;
    }
    let k = 2.0 / (period as f64 + 1.0);

    let seed_len = period.min(data.len());
    let mut ema_val: f64 = data[..seed_len].iter().sum::<f64>() / seed_len as f64;

    for &price in &data[seed_len..] {
        ema_val = price * k + ema_val * (1.0 - k);
    }
    ema_val
}

/// Rolling EMA, one value per input price. Warm-up positions (fewer than
/// `period` prices seen) are `None`.
pub fn ema_series(data: &[f64], period: usize) -> Vec<Option<f64>> {
    if period == 0 {
        return vec![None; data.len()];
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(data.len());
    let mut ema_val: Option<f64> = None;

    for (i, &price) in data.iter().enumerate() {
        if i + 1 < period {
            out.push(None);
            continue;
        }
        let next = match ema_val {
            None => data[..=i].iter().rev().take(period).sum::<f64>() / period as f64,
            Some(prev) => price * k + prev * (1.0 - k),
        };
        ema_val = Some(next);
        out.push(ema_val);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        let data = vec![50.0; 30];
        assert!((ema(&data, 10) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ema_series_marks_warmup_positions() {
        let data: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let series = ema_series(&data, 5);
        assert_eq!(series.len(), 10);
        assert!(series[3].is_none());
        assert!(series[4].is_some());
    }

    #[test]
    fn ema_tracks_trend_direction() {
        let up: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let fast = ema(&up, 5);
        let slow = ema(&up, 20);
        assert!(fast > slow, "fast EMA should lead in an up-trend");
    }
}
