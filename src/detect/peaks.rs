//! Local maximum search with a minimum separation between kept peaks.

/// Positions of local maxima in `signal`, ascending.
///
/// A sample is a peak when it is strictly greater than its left neighbour
/// and greater than the first differing sample on its right; flat tops
/// resolve to their midpoint (rounded down). The first and last samples are
/// never peaks. When `distance > 1`, peaks are kept in descending height
/// order and any other peak closer than `distance` samples to a kept one is
/// dropped.
pub fn find_peaks(signal: &[i32], distance: usize) -> Vec<usize> {
    let maxima = local_maxima(signal);
    if distance <= 1 || maxima.len() < 2 {
        return maxima;
    }
    select_by_distance(signal, maxima, distance)
}

fn local_maxima(signal: &[i32]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if signal.len() < 3 {
        return peaks;
    }
    let last = signal.len() - 1;
    let mut i = 1;
    while i < last {
        if signal[i - 1] < signal[i] {
            // Walk across a possible plateau.
            let mut ahead = i + 1;
            while ahead < last && signal[ahead] == signal[i] {
                ahead += 1;
            }
            if signal[ahead] < signal[i] {
                let left_edge = i;
                let right_edge = ahead - 1;
                peaks.push((left_edge + right_edge) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

fn select_by_distance(signal: &[i32], peaks: Vec<usize>, distance: usize) -> Vec<usize> {
    let mut keep = vec![true; peaks.len()];

    // Highest first; ties resolve to the earlier position.
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| signal[peaks[b]].cmp(&signal[peaks[a]]).then(a.cmp(&b)));

    for &j in &order {
        if !keep[j] {
            continue;
        }
        let mut k = j;
        while k > 0 && peaks[j] - peaks[k - 1] < distance {
            k -= 1;
            keep[k] = false;
        }
        let mut k = j + 1;
        while k < peaks.len() && peaks[k] - peaks[j] < distance {
            keep[k] = false;
            k += 1;
        }
    }

    peaks
        .into_iter()
        .zip(keep)
        .filter_map(|(p, kept)| kept.then_some(p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_maxima() {
        let signal = [0, 3, 1, 5, 2, 2, 7, 0];
        assert_eq!(find_peaks(&signal, 1), vec![1, 3, 6]);
    }

    #[test]
    fn test_edges_are_not_peaks() {
        let signal = [9, 1, 2, 1, 9];
        assert_eq!(find_peaks(&signal, 1), vec![2]);
    }

    #[test]
    fn test_plateau_midpoint() {
        let signal = [0, 4, 4, 4, 4, 0];
        assert_eq!(find_peaks(&signal, 1), vec![2]);
        // A plateau that keeps rising is not a peak.
        let rising = [0, 4, 4, 6, 0];
        assert_eq!(find_peaks(&rising, 1), vec![3]);
    }

    #[test]
    fn test_plateau_running_into_end_is_not_peak() {
        let signal = [0, 1, 5, 5, 5];
        assert!(find_peaks(&signal, 1).is_empty());
    }

    #[test]
    fn test_distance_keeps_larger() {
        let mut signal = vec![0; 200];
        signal[10] = 80;
        signal[40] = 90;
        assert_eq!(find_peaks(&signal, 50), vec![40]);
        assert_eq!(find_peaks(&signal, 30), vec![10, 40]);
    }

    #[test]
    fn test_distance_chain() {
        // 50 suppresses 30 and 70; 100 survives as it is exactly `distance` away.
        let mut signal = vec![0; 120];
        signal[30] = 10;
        signal[50] = 20;
        signal[70] = 10;
        signal[100] = 5;
        assert_eq!(find_peaks(&signal, 50), vec![50, 100]);
    }
}
