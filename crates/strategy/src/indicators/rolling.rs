/// Rolling mean over the trailing `window`. Warm-up positions are `None`.
pub fn rolling_mean(data: &[f64], window: usize) -> Vec<Option<f64>> {
    roll(data, window, |slice| {
        slice.iter().sum::<f64>() / slice.len() as f64
    })
}

/// Rolling population standard deviation over the trailing `window`.
pub fn rolling_std(data: &[f64], window: usize) -> Vec<Option<f64>> {
    roll(data, window, |slice| {
        let mean = slice.iter().sum::<f64>() / slice.len() as f64;
        let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / slice.len() as f64;
        var.sqrt()
    })
}

fn roll<F: Fn(&[f64]) -> f64>(data: &[f64], window: usize, f: F) -> Vec<Option<f64>> {
    if window == 0 {
        return vec![None; data.len()];
    }
    (0..data.len())
        .map(|i| {
            if i + 1 < window {
                None
            } else {
                Some(f(&data[i + 1 - window..=i]))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_mean_matches_hand_computation() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let means = rolling_mean(&data, 2);
        assert_eq!(means, vec![None, Some(1.5), Some(2.5), Some(3.5)]);
    }

    #[test]
    fn rolling_std_is_zero_for_constant_window() {
        let data = vec![5.0; 6];
        let stds = rolling_std(&data, 3);
        assert!(stds[5].unwrap().abs() < 1e-12);
    }
}
