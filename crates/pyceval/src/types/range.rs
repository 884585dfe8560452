use std::fmt::Write;

use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, Heap},
    resource::ResourceTracker,
    value::Value,
};

/// `range(start, stop, step)` with a non-zero step.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Range {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl Range {
    pub fn new(start: i64, stop: i64, step: i64) -> RunResult<Self> {
        if step == 0 {
            return Err(ExcType::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    pub fn len(&self) -> usize {
        let (start, stop, step) = (i128::from(self.start), i128::from(self.stop), i128::from(self.step));
        let n = if step > 0 && start < stop {
            (stop - start - 1) / step + 1
        } else if step < 0 && start > stop {
            (start - stop - 1) / (-step) + 1
        } else {
            0
        };
        usize::try_from(n).unwrap_or(usize::MAX)
    }

    /// Item at a non-negative index, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let index = i64::try_from(index).ok()?;
        Some(self.start + index * self.step)
    }

    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            value >= self.start && value < self.stop
        } else {
            value <= self.start && value > self.stop
        };
        in_bounds && (value - self.start) % self.step == 0
    }

    pub fn repr_into(&self, out: &mut String) {
        if self.step == 1 {
            let _ = write!(out, "range({}, {})", self.start, self.stop);
        } else {
            let _ = write!(out, "range({}, {}, {})", self.start, self.stop, self.step);
        }
    }
}

/// Ranges compare equal when they produce the same sequence.
impl PartialEq for Range {
    fn eq(&self, other: &Self) -> bool {
        let len = self.len();
        if len != other.len() {
            return false;
        }
        len == 0 || (self.start == other.start && (len == 1 || self.step == other.step))
    }
}

/// `slice(start, stop, step)`; each bound is `None` or an int.
#[derive(Debug)]
pub(crate) struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// Normalized slice bounds for a sequence of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SliceIndices {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
    pub len: usize,
}

impl SliceIndices {
    /// Positions selected by the slice, in order.
    pub fn positions(self) -> impl Iterator<Item = usize> {
        (0..self.len).filter_map(move |i| usize::try_from(self.start + i64::try_from(i).ok()? * self.step).ok())
    }
}

impl Slice {
    /// Clamps the bounds to `length`, following the sequence slicing rules.
    pub fn indices(&self, length: usize) -> RunResult<SliceIndices> {
        let length = i64::try_from(length).unwrap_or(i64::MAX);
        let step = match slice_bound(&self.step)? {
            None => 1,
            Some(0) => return Err(ExcType::value_error("slice step cannot be zero")),
            Some(step) => step,
        };
        let (lower, upper) = if step < 0 { (-1, length - 1) } else { (0, length) };
        let clamp = |bound: Option<i64>, default: i64| match bound {
            None => default,
            Some(b) if b < 0 => (b + length).max(lower),
            Some(b) => b.min(upper),
        };
        let start = clamp(slice_bound(&self.start)?, if step < 0 { upper } else { lower });
        let stop = clamp(slice_bound(&self.stop)?, if step < 0 { lower } else { upper });
        let len = if (step > 0 && start < stop) || (step < 0 && start > stop) {
            let span = (stop - start).abs() - 1;
            usize::try_from(span / step.abs() + 1).unwrap_or(0)
        } else {
            0
        };
        Ok(SliceIndices { start, stop, step, len })
    }
}

fn slice_bound(value: &Value) -> RunResult<Option<i64>> {
    match value {
        Value::None => Ok(None),
        other => other.as_index().map(Some).ok_or_else(|| {
            ExcType::type_error("slice indices must be integers or None or have an __index__ method")
        }),
    }
}

impl<T: ResourceTracker> DropWithHeap<T> for Slice {
    fn drop_with_heap(self, heap: &mut Heap<T>) {
        self.start.drop_with_heap(heap);
        self.stop.drop_with_heap(heap);
        self.step.drop_with_heap(heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_len_and_contains() {
        let r = Range::new(0, 10, 3).unwrap();
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), Some(9));
        assert!(r.contains(6));
        assert!(!r.contains(7));
        let down = Range::new(5, 0, -2).unwrap();
        assert_eq!(down.len(), 3);
        assert!(down.contains(1));
        assert_eq!(Range::new(0, 0, 1).unwrap(), Range::new(3, 1, 1).unwrap());
    }

    #[test]
    fn slice_clamps_bounds() {
        let s = Slice {
            start: Value::Int(-2),
            stop: Value::None,
            step: Value::None,
        };
        let idx = s.indices(5).unwrap();
        assert_eq!(idx.positions().collect::<Vec<_>>(), vec![3, 4]);

        let rev = Slice {
            start: Value::None,
            stop: Value::None,
            step: Value::Int(-2),
        };
        assert_eq!(rev.indices(5).unwrap().positions().collect::<Vec<_>>(), vec![4, 2, 0]);
    }
}
