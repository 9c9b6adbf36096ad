//! Permutation and shape helpers used by the structural rewriter.

/// `items` reordered so that position `i` holds `items[order[i]]`.
pub fn apply_order<T: Clone>(items: &[T], order: &[i64]) -> Vec<T> {
    order.iter().map(|&o| items[o as usize].clone()).collect()
}

pub fn is_identity(order: &[i64]) -> bool {
    order.iter().enumerate().all(|(i, &o)| o == i as i64)
}

pub fn is_permutation(order: &[i64]) -> bool {
    let mut seen = vec![false; order.len()];
    for &o in order {
        let Ok(o) = usize::try_from(o) else {
            return false;
        };
        match seen.get_mut(o) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}

/// Order equivalent to applying `first` and then `second`.
pub fn compose(first: &[i64], second: &[i64]) -> Vec<i64> {
    apply_order(first, second)
}

/// Pushes the index vector `0..rank` through each order in turn.
pub fn simulate(rank: usize, orders: &[&[i64]]) -> Vec<i64> {
    let mut index: Vec<i64> = (0..rank as i64).collect();
    for order in orders {
        index = apply_order(&index, order);
    }
    index
}

/// Removes axis `axis` from a permutation order, renumbering the rest.
fn remove_axis(order: &mut Vec<i64>, axis: i64) {
    order.retain(|&o| o != axis);
    for o in order.iter_mut() {
        if *o > axis {
            *o -= 1;
        }
    }
}

/// Rewrites a permutation over `shape` into an equivalent one of exactly
/// `to_dim` axes.
///
/// Extra axes are removed by first dropping unit axes and then merging axes
/// that stay adjacent under the permutation. Missing axes are added as
/// leading unit axes. Returns `None` if the rank cannot be reduced far enough.
pub fn reset(shape: &[i64], order: &[i64], to_dim: usize) -> Option<(Vec<i64>, Vec<i64>)> {
    let mut shape = shape.to_vec();
    let mut order = order.to_vec();

    if shape.len() < to_dim {
        let pad = to_dim - shape.len();
        let mut padded_shape = vec![1; pad];
        padded_shape.extend(shape);
        let mut padded_order: Vec<i64> = (0..pad as i64).collect();
        padded_order.extend(order.iter().map(|&o| o + pad as i64));
        return Some((padded_shape, padded_order));
    }

    while shape.len() > to_dim {
        let Some(axis) = shape.iter().position(|&d| d == 1) else {
            break;
        };
        shape.remove(axis);
        remove_axis(&mut order, axis as i64);
    }

    while shape.len() > to_dim {
        let Some(i) = order.windows(2).position(|w| w[0] + 1 == w[1]) else {
            break;
        };
        let axis = order[i] as usize;
        shape[axis] *= shape[axis + 1];
        shape.remove(axis + 1);
        remove_axis(&mut order, axis as i64 + 1);
    }

    (shape.len() == to_dim).then_some((shape, order))
}

/// True when the permutation only moves unit axes, i.e. it is a reshape.
pub fn moves_only_unit_axes(shape: &[i64], order: &[i64]) -> bool {
    let kept: Vec<i64> = order
        .iter()
        .copied()
        .filter(|&o| shape[o as usize] != 1)
        .collect();
    kept.windows(2).all(|w| w[0] < w[1])
}

/// Physically permutes a dense row-major tensor.
pub fn permute_data<T: Copy>(data: &[T], shape: &[i64], order: &[i64]) -> Vec<T> {
    let rank = shape.len();
    let out_shape = apply_order(shape, order);
    let in_strides = strides(shape);
    let total = num_elements(shape);
    let mut out = Vec::with_capacity(total);
    let mut index = vec![0i64; rank];
    for _ in 0..total {
        let mut offset = 0i64;
        for (axis, &i) in index.iter().enumerate() {
            offset += i * in_strides[order[axis] as usize];
        }
        out.push(data[offset as usize]);
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < out_shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    out
}

pub fn strides(shape: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

pub fn num_elements(shape: &[i64]) -> usize {
    shape.iter().product::<i64>().max(0) as usize
}

/// Broadcast result shape of two operands, right-aligned.
pub fn broadcast_shape(a: &[i64], b: &[i64]) -> Vec<i64> {
    let rank = a.len().max(b.len());
    let at = |s: &[i64], i: usize| {
        let pad = rank - s.len();
        if i < pad { 1 } else { s[i - pad] }
    };
    (0..rank).map(|i| at(a, i).max(at(b, i))).collect()
}

/// Whether two broadcastable shapes can be folded into 4 axes by merging
/// runs of axes that are either equal on both sides or broadcast the same way.
pub fn can_merge_to_4d(a: &[i64], b: &[i64]) -> bool {
    let rank = a.len().max(b.len());
    if rank <= 4 {
        return true;
    }
    let pad = |s: &[i64]| {
        let mut v = vec![1; rank - s.len()];
        v.extend_from_slice(s);
        v
    };
    let (a, b) = (pad(a), pad(b));
    // 0: equal, 1: a broadcasts, 2: b broadcasts
    let class = |i: usize| {
        if a[i] == b[i] {
            0
        } else if a[i] == 1 {
            1
        } else {
            2
        }
    };
    let mut runs = 1;
    for i in 1..rank {
        if class(i) != class(i - 1) && !(a[i] == 1 && b[i] == 1) {
            runs += 1;
        }
    }
    runs <= 4
}
