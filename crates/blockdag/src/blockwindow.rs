//! Blue-block windows over the selected-parent chain, used by the past
//! median time rule and by difficulty retargeting.

use crate::blocknode::{BlockNodeStore, NodeHandle};
use crate::params::Params;

/// Collects up to `window_size` blue blocks from `node`'s past: for each
/// block on the selected-parent chain, its blues in order (the selected
/// parent first). Genesis yields an empty window.
pub fn blue_block_window(
    nodes: &BlockNodeStore,
    node: NodeHandle,
    window_size: u64,
) -> Vec<NodeHandle> {
    let mut window = Vec::with_capacity(window_size as usize);
    let mut current = node;
    'outer: while nodes.node(current).selected_parent.is_some() {
        for &blue in &nodes.node(current).blues {
            if window.len() as u64 >= window_size {
                break 'outer;
            }
            window.push(blue);
        }
        current = nodes.node(current).selected_parent.expect("checked above");
    }
    window
}

pub fn median_timestamp(nodes: &BlockNodeStore, window: &[NodeHandle]) -> Option<i64> {
    if window.is_empty() {
        return None;
    }
    let mut times: Vec<i64> = window
        .iter()
        .map(|&handle| nodes.node(handle).timestamp())
        .collect();
    times.sort_unstable();
    Some(times[times.len() / 2])
}

/// The past median time of `node`; genesis falls back to its own
/// timestamp.
pub fn past_median_time(nodes: &BlockNodeStore, node: NodeHandle, params: &Params) -> i64 {
    let window = blue_block_window(nodes, node, params.past_median_time_window_size());
    median_timestamp(nodes, &window).unwrap_or_else(|| nodes.node(node).timestamp())
}
