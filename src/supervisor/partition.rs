use crate::protocol::WorkerId;

/// Split `frames` into one contiguous slice per worker.
///
/// `frames` must be ascending. With `N` frames and `W` workers the first
/// `N mod W` workers get `N / W + 1` frames and the rest get `N / W`, in
/// attach order. Workers past the end of the frame list get an empty slice.
/// The result depends only on the inputs, so calling it twice on the same
/// state yields the same assignment.
pub fn contiguous(frames: &[u32], workers: &[WorkerId]) -> Vec<(WorkerId, Vec<u32>)> {
    if workers.is_empty() {
        return Vec::new();
    }

    let base = frames.len() / workers.len();
    let extra = frames.len() % workers.len();

    let mut slices = Vec::with_capacity(workers.len());
    let mut start = 0;
    for (i, worker) in workers.iter().enumerate() {
        let len = if i < extra { base + 1 } else { base };
        slices.push((worker.clone(), frames[start..start + len].to_vec()));
        start += len;
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(n: usize) -> Vec<WorkerId> {
        (0..n).map(|i| WorkerId::new(format!("w{i}"))).collect()
    }

    #[test]
    fn ten_frames_over_two_workers() {
        let frames: Vec<u32> = (1..=10).collect();
        let ws = vec![WorkerId::from("A"), WorkerId::from("B")];

        let slices = contiguous(&frames, &ws);

        assert_eq!(slices[0], (WorkerId::from("A"), vec![1, 2, 3, 4, 5]));
        assert_eq!(slices[1], (WorkerId::from("B"), vec![6, 7, 8, 9, 10]));
    }

    #[test]
    fn remainder_goes_to_first_workers() {
        let frames: Vec<u32> = (1..=11).collect();
        let sizes: Vec<usize> = contiguous(&frames, &workers(3))
            .iter()
            .map(|(_, s)| s.len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 3]);
    }

    #[test]
    fn sizes_and_union_hold_for_many_shapes() {
        for n in 0..40u32 {
            for w in 1..9usize {
                let frames: Vec<u32> = (100..100 + n).collect();
                let slices = contiguous(&frames, &workers(w));
                assert_eq!(slices.len(), w);

                let floor = n as usize / w;
                for (_, slice) in &slices {
                    assert!(slice.len() == floor || slice.len() == floor + 1);
                }

                let union: Vec<u32> = slices.iter().flat_map(|(_, s)| s.clone()).collect();
                assert_eq!(union, frames, "n={n} w={w}");
            }
        }
    }

    #[test]
    fn more_workers_than_frames_leaves_trailing_workers_empty() {
        let slices = contiguous(&[7, 8], &workers(4));
        assert_eq!(slices[0].1, vec![7]);
        assert_eq!(slices[1].1, vec![8]);
        assert!(slices[2].1.is_empty());
        assert!(slices[3].1.is_empty());
    }

    #[test]
    fn same_input_same_partition() {
        let frames = vec![3, 5, 9, 10, 11, 40];
        let ws = workers(4);
        assert_eq!(contiguous(&frames, &ws), contiguous(&frames, &ws));
    }

    #[test]
    fn no_workers_no_slices() {
        assert!(contiguous(&[1, 2, 3], &[]).is_empty());
    }
}
