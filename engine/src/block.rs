//! Piece/block geometry. Adapted from the teacher's `block.rs`: the same
//! block-size arithmetic, generalized to the request-size terminology the
//! design uses (`request_size` rather than a hardcoded constant import).

#[cfg(test)]
use crate::BLOCK_SIZE;

/// A concrete range of bytes within one piece, as requested or delivered on
/// the wire.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct BlockInfo {
    pub piece_idx: usize,
    pub begin: usize,
    pub length: usize,
}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self, request_size: usize) -> usize {
        self.begin / request_size
    }
}

/// A block's payload as delivered in a PIECE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub piece_idx: usize,
    pub begin: usize,
    pub data: Vec<u8>,
}

/// Length in bytes of block `block_idx` within a piece of length
/// `piece_len`, given `request_size` bytes per block (the last block is
/// shorter when `piece_len` does not divide evenly).
pub fn block_len(piece_len: usize, block_idx: usize, request_size: usize) -> usize {
    request_size.min(piece_len - (block_idx * request_size))
}

/// Number of blocks a piece of length `piece_len` is split into.
pub fn num_blocks(piece_len: usize, request_size: usize) -> u32 {
    ((piece_len + (request_size - 1)) / request_size) as u32
}

/// Every `(begin, length)` block in a piece of length `piece_len`, smallest
/// `begin` first -- the order `new_request` draws from.
pub fn plan_blocks(piece_len: usize, request_size: usize) -> Vec<BlockInfo> {
    let n = num_blocks(piece_len, request_size);
    (0..n)
        .map(|i| BlockInfo {
            piece_idx: 0,
            begin: i as usize * request_size,
            length: block_len(piece_len, i as usize, request_size),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_len_matches_trailing_remainder() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        assert_eq!(block_len(normal_piece_len, 0, BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(block_len(normal_piece_len, 1, BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(block_len(last_piece_len, 0, BLOCK_SIZE), BLOCK_SIZE);
        assert_eq!(block_len(last_piece_len, 1, BLOCK_SIZE), 8546);
    }

    #[test]
    fn num_blocks_rounds_up() {
        for i in 0..12u32 {
            assert_eq!(num_blocks(BLOCK_SIZE * i as usize, BLOCK_SIZE), i);
        }
        assert_eq!(num_blocks(BLOCK_SIZE + 500, BLOCK_SIZE), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000, BLOCK_SIZE), 6);
        assert_eq!(num_blocks(0, BLOCK_SIZE), 0);
    }

    #[test]
    fn plan_blocks_covers_the_whole_piece_in_order() {
        let plan = plan_blocks(BLOCK_SIZE * 2 + 1000, BLOCK_SIZE);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].begin, 0);
        assert_eq!(plan[1].begin, BLOCK_SIZE);
        assert_eq!(plan[2].begin, BLOCK_SIZE * 2);
        assert_eq!(plan[2].length, 1000);
    }
}
