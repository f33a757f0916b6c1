use std::fmt;

/// Decides where a full page is cut when it splits. The split index is
/// the position of the first record that moves to the new right sibling.
///
/// All policies work on the byte sizes of the records, not their count,
/// since records are variable-length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    /// Keep the left page light.
    LeftBias,
    /// Balance the byte load of both pages.
    EvenBias,
    /// Keep the right page light.
    RightBias,
    /// EvenBias, except for appends at the right edge, which leave the
    /// left page nearly full. Friendly to ascending-key loads.
    NiceBias,
    /// Cut exactly at the insertion point, packing the left page as
    /// tight as the incoming record allows.
    PackBias,
}

impl SplitPolicy {
    /// `sizes` are the record byte sizes of the page being split,
    /// `insert_at` is the slot the incoming record would land in.
    /// Returns an index in `1..sizes.len()`; both halves stay non-empty.
    pub fn split_index(&self, sizes: &[usize], insert_at: usize) -> usize {
        let n = sizes.len();
        debug_assert!(n >= 2);

        let index = match self {
            SplitPolicy::LeftBias => Self::index_at_fraction(sizes, 1, 3),
            SplitPolicy::EvenBias => Self::index_at_fraction(sizes, 1, 2),
            SplitPolicy::RightBias => Self::index_at_fraction(sizes, 2, 3),
            SplitPolicy::NiceBias => {
                if insert_at == n {
                    Self::index_at_fraction(sizes, 9, 10)
                } else {
                    Self::index_at_fraction(sizes, 1, 2)
                }
            }
            SplitPolicy::PackBias => insert_at,
        };

        index.max(1).min(n - 1)
    }

    /// Smallest index k such that the bytes of records[..k] reach
    /// `num/den` of the total.
    fn index_at_fraction(sizes: &[usize], num: usize, den: usize) -> usize {
        let total: usize = sizes.iter().sum();
        let target = total * num / den;
        let mut acc = 0;
        for (i, s) in sizes.iter().enumerate() {
            acc += s;
            if acc >= target {
                return i + 1;
            }
        }
        sizes.len() - 1
    }
}

impl Default for SplitPolicy {
    fn default() -> Self {
        SplitPolicy::NiceBias
    }
}

impl fmt::Display for SplitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decides how two adjacent pages are rebalanced when a range removal
/// leaves them underfull but too big to coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPolicy {
    LeftBias,
    EvenBias,
    RightBias,
}

impl JoinPolicy {
    /// Given the concatenated record sizes of both pages, choose the
    /// boundary index: records before it stay left, the rest go right.
    /// Only boundaries where both sides fit in `capacity` are eligible.
    pub fn rebalance_index(&self, sizes: &[usize], capacity: usize) -> Option<usize> {
        let total: usize = sizes.iter().sum();
        let n = sizes.len();

        let mut best: Option<(usize, usize)> = None;
        let mut left_bytes = 0;
        for k in 1..n {
            left_bytes += sizes[k - 1];
            let right_bytes = total - left_bytes;
            if left_bytes > capacity || right_bytes > capacity {
                continue;
            }
            let score = match self {
                JoinPolicy::LeftBias => left_bytes,
                JoinPolicy::RightBias => right_bytes,
                JoinPolicy::EvenBias => {
                    left_bytes.max(right_bytes) - left_bytes.min(right_bytes)
                }
            };
            match best {
                Some((best_score, _)) if best_score <= score => {}
                _ => best = Some((score, k)),
            }
        }

        best.map(|(_, k)| k)
    }
}

impl Default for JoinPolicy {
    fn default() -> Self {
        JoinPolicy::EvenBias
    }
}

impl fmt::Display for JoinPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_index_bounds() {
        let sizes = vec![100; 10];
        for policy in [
            SplitPolicy::LeftBias,
            SplitPolicy::EvenBias,
            SplitPolicy::RightBias,
            SplitPolicy::NiceBias,
            SplitPolicy::PackBias,
        ]
        .iter()
        {
            for insert_at in 0..=10 {
                let k = policy.split_index(&sizes, insert_at);
                assert!(k >= 1 && k <= 9, "{:?} returned {}", policy, k);
            }
        }
    }

    #[test]
    fn test_nice_bias_packs_sequential_appends() {
        let sizes = vec![50; 20];
        let k = SplitPolicy::NiceBias.split_index(&sizes, 20);
        assert!(k >= 15, "append split point too early: {}", k);

        let k = SplitPolicy::NiceBias.split_index(&sizes, 3);
        assert_eq!(k, 10);
    }

    #[test]
    fn test_rebalance_prefers_feasible_boundary() {
        // two big records and several small ones
        let sizes = vec![400, 50, 50, 50, 400];
        let k = JoinPolicy::EvenBias.rebalance_index(&sizes, 600).unwrap();
        let left: usize = sizes[..k].iter().sum();
        let right: usize = sizes[k..].iter().sum();
        assert!(left <= 600 && right <= 600);
    }

    #[test]
    fn test_rebalance_impossible() {
        let sizes = vec![500, 500, 500];
        assert_eq!(JoinPolicy::EvenBias.rebalance_index(&sizes, 400), None);
    }
}
