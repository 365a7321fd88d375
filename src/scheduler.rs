/// A group of diffusion channels denoised together: a channel followed by its angular neighbors.
/// Carries indices only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBlock {
    pub channels: Vec<usize>,
}

impl ScheduledBlock {
    pub fn new(channels: Vec<usize>) -> Self {
        Self { channels }
    }
}

/// one candidate block per channel, in channel order: {channel} followed by its neighbors
pub fn channel_sets(neighbors: &[Vec<usize>]) -> Vec<ScheduledBlock> {
    neighbors.iter().enumerate().map(|(channel, set)| {
        let mut channels = Vec::with_capacity(set.len() + 1);
        channels.push(channel);
        channels.extend_from_slice(set);
        ScheduledBlock::new(channels)
    }).collect()
}

/// Greedy covering in candidate order: a candidate is kept if it holds at least one channel no
/// kept block holds yet, and the scan stops as soon as every channel of every candidate is held.
/// Scanning in channel order (rather than by largest gain) keeps neighboring directions together
/// and makes the schedule reproducible.
pub fn greedy_cover(candidates: &[ScheduledBlock]) -> Vec<ScheduledBlock> {
    let universe_len = candidates.iter().flat_map(|b| b.channels.iter()).max().map_or(0, |&m| m + 1);
    let mut in_universe = vec![false; universe_len];
    candidates.iter().flat_map(|b| b.channels.iter()).for_each(|&c| in_universe[c] = true);
    let mut uncovered = in_universe.iter().filter(|&&u| u).count();

    let mut covered = vec![false; universe_len];
    let mut selected = Vec::new();
    for block in candidates {
        if uncovered == 0 {
            break;
        }
        if block.channels.iter().any(|&c| !covered[c]) {
            for &c in &block.channels {
                if !covered[c] {
                    covered[c] = true;
                    uncovered -= 1;
                }
            }
            selected.push(block.clone());
        }
    }
    selected
}

/// the blocks to denoise for a neighbor table. Without greedy subsampling every channel's block
/// is processed.
pub fn schedule_blocks(neighbors: &[Vec<usize>], greedy: bool) -> Vec<ScheduledBlock> {
    let candidates = channel_sets(neighbors);
    if greedy {
        greedy_cover(&candidates)
    } else {
        candidates
    }
}
