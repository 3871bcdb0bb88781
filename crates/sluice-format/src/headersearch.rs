use crate::formats::{FormatError, FrameGeometry, TrackFormat};

enum Follow {
    /// A (possibly partial) header sits in this buffer.
    Hit,
    /// Buffer scanned clean, next header is beyond it.
    Miss,
    /// The predicted position did not hold a sync word.
    Lost { hit: bool },
}

/// Stateful frame-header tracker.
///
/// Fed sequential chunks of a data stream, it answers "does this chunk
/// straddle a frame header?". State is carried across calls so a sync word
/// spilling over a chunk boundary is still recognised, and when the next
/// header is not where predicted it rescans the chunk and re-anchors.
///
/// The network writer asks this before shedding load: a chunk that holds
/// (part of) a header must not be dropped or the correlator downstream
/// loses synchronisation, which costs far more than the payload bytes.
pub struct HeaderSearch {
    geom: FrameGeometry,
    ntrack: u32,
    /// Distance from the start of the *next* chunk to the next expected
    /// header, valid while a header position is being tracked.
    bytes_to_next: usize,
    /// Sync-word bytes already matched at the tail of the previous chunk.
    bytes_found: usize,
    tracking: bool,
}

impl HeaderSearch {
    pub fn new(format: TrackFormat, ntrack: u32) -> Result<Self, FormatError> {
        Ok(Self::from_geometry(format.geometry(ntrack, None)?, ntrack))
    }

    pub fn from_geometry(geom: FrameGeometry, ntrack: u32) -> Self {
        Self { geom, ntrack, bytes_to_next: 0, bytes_found: 0, tracking: false }
    }

    pub fn geometry(&self) -> &FrameGeometry {
        &self.geom
    }

    pub fn ntrack(&self) -> u32 {
        self.ntrack
    }

    /// Forget everything and start scanning afresh.
    pub fn reset(&mut self) {
        self.bytes_to_next = 0;
        self.bytes_found = 0;
        self.tracking = false;
    }

    /// True when `buf`, as the next sequential chunk of the stream,
    /// overlaps a frame-header location.
    pub fn contains_header(&mut self, buf: &[u8]) -> bool {
        let n = buf.len();
        if n == 0 {
            return false;
        }

        // Syncless formats: pure stride prediction from the stream origin.
        if self.geom.sync.is_empty() {
            let hit = self.bytes_to_next < n;
            let frame = self.geom.framesize;
            let mut next = self.bytes_to_next;
            while next < n {
                next += frame;
            }
            self.bytes_to_next = next - n;
            return hit;
        }

        // A sync word split across the chunk boundary resumes here.
        if self.bytes_found > 0 {
            let sync_len = self.geom.sync.len();
            let need = sync_len - self.bytes_found;
            let take = need.min(n);
            if buf[..take] == self.geom.sync[self.bytes_found..self.bytes_found + take] {
                if take < need {
                    self.bytes_found += take;
                    return true;
                }
                // full word confirmed; its frame started before this chunk
                self.bytes_found = 0;
                let _ = self.follow(buf, take + self.geom.framesize - sync_len);
                return true;
            }
            // false prefix; drop the carry and rescan below
            self.bytes_found = 0;
            self.tracking = false;
        } else if self.tracking {
            match self.follow(buf, self.bytes_to_next) {
                Follow::Hit => return true,
                Follow::Miss => return false,
                Follow::Lost { hit } => {
                    if self.rescan(buf) {
                        return true;
                    }
                    return hit;
                }
            }
        }

        self.rescan(buf)
    }

    /// Predict-and-check headers at frame strides starting at offset `at`.
    fn follow(&mut self, buf: &[u8], mut at: usize) -> Follow {
        let n = buf.len();
        let sync = &self.geom.sync;
        let frame = self.geom.framesize;
        let mut hit = false;

        loop {
            if at >= n {
                self.tracking = true;
                self.bytes_to_next = at - n;
                return if hit { Follow::Hit } else { Follow::Miss };
            }
            let take = sync.len().min(n - at);
            if buf[at..at + take] != sync[..take] {
                self.tracking = false;
                return Follow::Lost { hit };
            }
            hit = true;
            if take < sync.len() {
                // word runs off the end of this chunk
                self.tracking = true;
                self.bytes_found = take;
                self.bytes_to_next = at + frame - n;
                return Follow::Hit;
            }
            at += frame;
        }
    }

    /// Brute scan for a sync word anywhere in the chunk; re-anchors the
    /// tracker on a match.
    fn rescan(&mut self, buf: &[u8]) -> bool {
        let n = buf.len();
        let sync_len = self.geom.sync.len();
        for p in 0..n {
            let take = sync_len.min(n - p);
            if buf[p..p + take] == self.geom.sync[..take] {
                if take == sync_len {
                    let _ = self.follow(buf, p + self.geom.framesize);
                } else {
                    self.tracking = false;
                    self.bytes_found = take;
                }
                return true;
            }
        }
        self.tracking = false;
        self.bytes_found = 0;
        false
    }
}

#[cfg(test)]
mod test {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::formats::FrameGeometry;

    fn small_geometry() -> FrameGeometry {
        FrameGeometry {
            format: TrackFormat::Mark5B,
            framesize: 100,
            sync: vec![0xED, 0xDE, 0xAD, 0xAB],
        }
    }

    fn stream(geom: &FrameGeometry, frames: usize, rng: &mut StdRng) -> Vec<u8> {
        let mut out = Vec::with_capacity(frames * geom.framesize);
        for _ in 0..frames {
            out.extend_from_slice(&geom.sync);
            for _ in geom.sync.len()..geom.framesize {
                // payload bytes never look like the start of a sync word
                out.push(rng.random_range(1..=0x7Fu8));
            }
        }
        out
    }

    #[test]
    fn detects_headers_under_arbitrary_chunking() {
        let geom = small_geometry();
        let mut rng = StdRng::seed_from_u64(0x5B5B);
        let data = stream(&geom, 40, &mut rng);

        for _ in 0..50 {
            let mut hs = HeaderSearch::from_geometry(geom.clone(), 0);
            let mut pos = 0usize;
            while pos < data.len() {
                let len = rng.random_range(1..=37).min(data.len() - pos);
                let chunk = &data[pos..pos + len];
                let expect = (0..40).any(|k| {
                    let h = k * geom.framesize;
                    h < pos + len && pos < h + geom.sync.len()
                });
                assert_eq!(
                    hs.contains_header(chunk),
                    expect,
                    "chunk [{pos}, {}) misjudged",
                    pos + len
                );
                pos += len;
            }
        }
    }

    #[test]
    fn reanchors_after_lost_sync() {
        let geom = small_geometry();
        let mut rng = StdRng::seed_from_u64(7);
        let clean = stream(&geom, 4, &mut rng);

        let mut hs = HeaderSearch::from_geometry(geom.clone(), 0);
        assert!(hs.contains_header(&clean[..50]));

        // drop 30 bytes of stream: the predicted header position is now
        // wrong, but the real header later in the chunk is still found
        let rest = &clean[80..];
        assert!(hs.contains_header(rest));

        // and tracking continues at the new anchor
        let more = stream(&geom, 2, &mut rng);
        let mut fed = 0;
        let mut any = false;
        while fed < more.len() {
            let take = 33.min(more.len() - fed);
            any |= hs.contains_header(&more[fed..fed + take]);
            fed += take;
        }
        assert!(any);
    }

    #[test]
    fn sync_split_across_chunks_counts_on_both_sides() {
        let geom = small_geometry();
        let mut rng = StdRng::seed_from_u64(99);
        let data = stream(&geom, 2, &mut rng);

        let mut hs = HeaderSearch::from_geometry(geom.clone(), 0);
        // split the second frame's sync word down the middle
        let cut = geom.framesize + 2;
        assert!(hs.contains_header(&data[..cut]));
        assert!(hs.contains_header(&data[cut..cut + 10]));
    }

    #[test]
    fn vdif_predicts_by_stride() {
        let geom = TrackFormat::Vdif.geometry(0, Some(50)).unwrap();
        let mut hs = HeaderSearch::from_geometry(geom, 0);
        let buf = [0u8; 30];
        // frame starts at 0, 50, 100, 150 against 30-byte chunks
        let hits: Vec<bool> = (0..5).map(|_| hs.contains_header(&buf)).collect();
        assert_eq!(hits, vec![true, true, false, true, false]);
    }
}
