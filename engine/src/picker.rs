//! Rarest-first piece picker (design §4.5).
//!
//! Adapted from the teacher's `picker::piece_picker::Pieces`: the same
//! per-piece frequency table and `have`/`interested` bookkeeping, but
//! `pick_new_piece`'s first-available linear scan is replaced with a true
//! rarest-first scan (lowest frequency, ties broken by lowest index -- the
//! deterministic tie-break the design calls out as an open question it asks
//! us to decide rather than guess at the original's exact behaviour).

#[derive(Debug, Clone, Copy, Default)]
struct PieceState {
    frequency: u32,
    /// True once some peer's request loop has drawn a block from this
    /// piece, so a second peer's refill doesn't restart the same piece from
    /// scratch while it's mid-flight (the teacher's `is_partial`).
    in_progress: bool,
    /// False once `complete` has removed the piece from the pickable pool.
    in_pool: bool,
}

#[derive(Debug)]
pub struct PiecePicker {
    pieces: Vec<PieceState>,
    remaining: usize,
}

impl PiecePicker {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            pieces: vec![PieceState { in_pool: true, ..Default::default() }; num_pieces],
            remaining: num_pieces,
        }
    }

    /// Called when a peer announces it has piece `i` (via BITFIELD or HAVE).
    pub fn got_have(&mut self, i: usize) {
        self.pieces[i].frequency += 1;
    }

    /// Called when a peer disconnects or we learn it no longer has `i`.
    pub fn lost_have(&mut self, i: usize) {
        self.pieces[i].frequency = self.pieces[i].frequency.saturating_sub(1);
    }

    /// Rarest piece satisfying `want`, ties broken by lowest index. Skips
    /// pieces no longer in the pickable pool (already `complete`d).
    pub fn next(&self, want: impl Fn(usize) -> bool, seeding: bool) -> Option<usize> {
        let mut best: Option<(u32, usize)> = None;
        for (i, p) in self.pieces.iter().enumerate() {
            if !p.in_pool {
                continue;
            }
            if !seeding && p.in_progress {
                continue;
            }
            if p.frequency == 0 || !want(i) {
                continue;
            }
            match best {
                Some((freq, _)) if freq <= p.frequency => {}
                _ => best = Some((p.frequency, i)),
            }
        }
        best.map(|(_, i)| i)
    }

    /// Records that a request has gone out for piece `i`.
    pub fn requested(&mut self, i: usize, seeding: bool) {
        if !seeding {
            self.pieces[i].in_progress = true;
        }
    }

    /// Piece `i` is fully present and validated; remove it from the pool.
    pub fn complete(&mut self, i: usize) {
        if self.pieces[i].in_pool {
            self.pieces[i].in_pool = false;
            self.remaining -= 1;
        }
    }

    /// Piece `i` just failed validation: put it back up for picking.
    pub fn bump(&mut self, i: usize) {
        self.pieces[i].in_progress = false;
        self.pieces[i].in_pool = true;
    }

    pub fn am_i_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn frequency(&self, i: usize) -> u32 {
        self.pieces[i].frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_rarest_piece() {
        let mut p = PiecePicker::new(3);
        p.got_have(0);
        p.got_have(0);
        p.got_have(1);
        p.got_have(2);
        // piece 1 and 2 tie at frequency 1; piece 0 is more common.
        assert_eq!(p.next(|_| true, false), Some(1));
    }

    #[test]
    fn ties_break_on_lowest_index() {
        let mut p = PiecePicker::new(3);
        p.got_have(2);
        p.got_have(1);
        p.got_have(0);
        assert_eq!(p.next(|_| true, false), Some(0));
    }

    #[test]
    fn in_progress_pieces_are_skipped_outside_endgame() {
        let mut p = PiecePicker::new(2);
        p.got_have(0);
        p.got_have(1);
        p.requested(0, false);
        assert_eq!(p.next(|_| true, false), Some(1));
    }

    #[test]
    fn seeding_ignores_in_progress() {
        let mut p = PiecePicker::new(2);
        p.got_have(0);
        p.got_have(1);
        p.requested(0, false);
        assert_eq!(p.next(|_| true, true), Some(0));
    }

    #[test]
    fn complete_removes_from_pool_and_bump_restores_it() {
        let mut p = PiecePicker::new(1);
        p.got_have(0);
        assert!(!p.am_i_complete());
        p.complete(0);
        assert!(p.am_i_complete());
        assert_eq!(p.next(|_| true, false), None);
        p.bump(0);
        assert!(!p.am_i_complete());
        assert_eq!(p.next(|_| true, false), Some(0));
    }

    #[test]
    fn want_predicate_filters_candidates() {
        let mut p = PiecePicker::new(2);
        p.got_have(0);
        p.got_have(1);
        assert_eq!(p.next(|i| i == 1, false), Some(1));
    }
}
