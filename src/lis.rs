//! Longest strictly increasing subsequence.

/// Indices of a longest strictly increasing subsequence of `values`.
///
/// Runs in `O(n log n)`. Among several longest subsequences, the one ending
/// in the smallest possible values is returned.
///
/// ```
/// use grammar_miner::lis::longest_increasing_subsequence;
///
/// assert_eq!(longest_increasing_subsequence(&[3, 1, 4, 1, 5, 9, 2, 6]), vec![1, 2, 4, 7]);
/// ```
pub fn longest_increasing_subsequence<T: Ord>(values: &[T]) -> Vec<usize> {
    // tails[k]: index of the smallest tail of an increasing run of length k + 1.
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; values.len()];
    for (i, value) in values.iter().enumerate() {
        let k = tails.partition_point(|&t| values[t] < *value);
        if k > 0 {
            prev[i] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(i);
        } else {
            tails[k] = i;
        }
    }
    let mut result = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        result.push(i);
        cursor = prev[i];
    }
    result.reverse();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_empty() {
        assert!(longest_increasing_subsequence::<u32>(&[]).is_empty());
    }

    #[test]
    fn test_sorted_input_spans_all() {
        assert_eq!(longest_increasing_subsequence(&[1, 2, 3, 10]), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_strict() {
        assert_eq!(longest_increasing_subsequence(&[2, 2, 2]).len(), 1);
    }

    #[test]
    fn test_out_of_order_element_is_excluded() {
        let lis = longest_increasing_subsequence(&[1, 2, 9, 3, 4]);
        assert_eq!(lis, vec![0, 1, 3, 4]);
    }
}
