//! Annex-B demuxing and parameter-set tracking.
//!
//! The server writes a raw Annex-B byte stream: NAL units separated by
//! start codes (0x000001 or 0x00000001) with no other framing. Socket reads
//! split that stream at arbitrary points, so the [`Demuxer`] keeps the
//! unterminated tail between calls and only emits a unit once the next
//! start code has been seen.
//!
//! The decoder wants the opposite framing, a 4-byte big-endian length in
//! front of each unit, which [`to_length_prefixed`] produces.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use mirror_ipc::VideoCodec;

/// Upper bound on buffered bytes that have not yet formed a complete unit.
///
/// A stream that never produces another start code would otherwise grow the
/// buffer without limit. Past this bound the tail is discarded and the
/// demuxer resynchronizes on the next start code.
pub const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Longest start code minus one; the bytes that may hold a split start code.
const START_CODE_TAIL: usize = 3;

/// Role of a NAL unit in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalKind {
    /// Video Parameter Set (H.265 only).
    Vps,
    /// Sequence Parameter Set.
    Sps,
    /// Picture Parameter Set.
    Pps,
    /// Slice data, SEI, delimiters and everything else.
    Frame,
}

impl NalKind {
    /// Extract the type code from a NAL header byte and classify it.
    pub fn classify(codec: VideoCodec, header: u8) -> (u8, NalKind) {
        match codec {
            VideoCodec::H264 => {
                let code = header & 0x1F;
                let kind = match code {
                    7 => NalKind::Sps,
                    8 => NalKind::Pps,
                    _ => NalKind::Frame,
                };
                (code, kind)
            }
            VideoCodec::H265 => {
                let code = (header >> 1) & 0x3F;
                let kind = match code {
                    32 => NalKind::Vps,
                    33 => NalKind::Sps,
                    34 => NalKind::Pps,
                    _ => NalKind::Frame,
                };
                (code, kind)
            }
        }
    }
}

/// A single NAL unit extracted from an Annex-B stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    /// Codec-specific NAL type code.
    pub type_code: u8,
    /// Classification of the unit.
    pub kind: NalKind,
    /// The NAL unit data (including the NAL header byte, excluding start code).
    pub payload: Bytes,
}

impl NalUnit {
    /// Classify a payload. Returns `None` for an empty payload.
    pub fn parse(codec: VideoCodec, payload: Bytes) -> Option<Self> {
        let header = *payload.first()?;
        let (type_code, kind) = NalKind::classify(codec, header);
        Some(Self {
            type_code,
            kind,
            payload,
        })
    }

    /// Whether this unit is a VPS, SPS or PPS.
    pub fn is_parameter_set(&self) -> bool {
        !matches!(self.kind, NalKind::Frame)
    }
}

/// The most recent parameter sets seen in the stream.
///
/// Later units of the same kind replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSetCache {
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

impl ParameterSetCache {
    pub fn vps(&self) -> Option<&Bytes> {
        self.vps.as_ref()
    }

    pub fn sps(&self) -> Option<&Bytes> {
        self.sps.as_ref()
    }

    pub fn pps(&self) -> Option<&Bytes> {
        self.pps.as_ref()
    }

    /// Whether every parameter set the codec needs is present.
    pub fn is_complete(&self, codec: VideoCodec) -> bool {
        let base = self.sps.is_some() && self.pps.is_some();
        if codec.requires_vps() {
            base && self.vps.is_some()
        } else {
            base
        }
    }

    /// Store a parameter-set unit. Returns false for frame units.
    pub fn store(&mut self, unit: &NalUnit) -> bool {
        let slot = match unit.kind {
            NalKind::Vps => &mut self.vps,
            NalKind::Sps => &mut self.sps,
            NalKind::Pps => &mut self.pps,
            NalKind::Frame => return false,
        };
        *slot = Some(unit.payload.clone());
        true
    }

    /// Forget all parameter sets.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Stateful Annex-B scanner.
#[derive(Debug)]
pub struct Demuxer {
    codec: VideoCodec,
    buffer: BytesMut,
    cache: ParameterSetCache,
    discarded_bytes: u64,
    /// Offset in `buffer` where the next start code search resumes.
    scan_from: usize,
}

impl Demuxer {
    /// Create a demuxer for the given codec.
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::with_capacity(crate::READ_BUFFER_SIZE),
            cache: ParameterSetCache::default(),
            discarded_bytes: 0,
            scan_from: 0,
        }
    }

    /// Codec this demuxer classifies for.
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Parameter sets seen so far.
    pub fn cache(&self) -> &ParameterSetCache {
        &self.cache
    }

    /// Bytes held back waiting for the next start code.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes thrown away before a start code or on overflow.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }

    /// Append `data` and return every unit it completes.
    ///
    /// A unit is complete once the following start code has arrived; the
    /// last unit in the buffer therefore stays pending until more data
    /// comes in. Parameter sets also update the cache.
    pub fn parse(&mut self, data: &[u8]) -> Vec<NalUnit> {
        let mut units = Vec::new();
        self.parse_each(data, |unit, _| units.push(unit));
        units
    }

    /// Like [`Demuxer::parse`], but hands each unit to `on_unit` together
    /// with the cache as it stood right after that unit.
    pub fn parse_each<F>(&mut self, data: &[u8], mut on_unit: F)
    where
        F: FnMut(NalUnit, &ParameterSetCache),
    {
        self.buffer.extend_from_slice(data);

        let Some((start, mut code_len)) = find_start_code(&self.buffer, 0) else {
            // Keep what could be the front of a split start code.
            let excess = self.buffer.len().saturating_sub(START_CODE_TAIL);
            self.discard_front(excess);
            self.scan_from = 0;
            return;
        };
        self.discard_front(start);

        // Bytes before `scan_from` were searched on an earlier call.
        let mut from = if start == 0 {
            self.scan_from.max(code_len)
        } else {
            code_len
        };

        while let Some((next, next_len)) = find_start_code(&self.buffer, from) {
            let span = self.buffer.split_to(next).freeze();
            let payload = span.slice(code_len..);
            code_len = next_len;
            from = code_len;

            let Some(unit) = NalUnit::parse(self.codec, payload) else {
                trace!("Dropping empty NAL span");
                continue;
            };

            if self.cache.store(&unit) {
                debug!(
                    kind = ?unit.kind,
                    len = unit.payload.len(),
                    "Parameter set updated"
                );
            }
            on_unit(unit, &self.cache);
        }

        if self.buffer.len() > MAX_PENDING_BYTES {
            warn!(
                pending = self.buffer.len(),
                limit = MAX_PENDING_BYTES,
                "Unterminated NAL unit exceeds buffer limit, resynchronizing"
            );
            let excess = self.buffer.len() - START_CODE_TAIL;
            self.discard_front(excess);
            self.scan_from = 0;
            return;
        }

        // The last few bytes may start a code that is still incomplete.
        self.scan_from = self.buffer.len().saturating_sub(START_CODE_TAIL);
    }

    /// Drop all buffered bytes and parameter sets.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cache.clear();
        self.scan_from = 0;
    }

    fn discard_front(&mut self, count: usize) {
        if count > 0 {
            self.buffer.advance(count);
            self.discarded_bytes += count as u64;
        }
    }
}

/// Find the first start code at or after `from`.
///
/// Returns its offset and length (3 or 4). A 4-byte code is preferred when
/// the three-byte pattern is preceded by an extra zero.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 4 <= data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Prefix a NAL payload with its 4-byte big-endian length.
pub fn to_length_prefixed(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xAB];
    const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21, 0x00];

    fn annex_b(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
            out.extend_from_slice(unit);
        }
        out
    }

    fn payloads(units: &[NalUnit]) -> Vec<Vec<u8>> {
        units.iter().map(|u| u.payload.to_vec()).collect()
    }

    #[test]
    fn test_parse_3byte_start_code() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let units = demuxer.parse(&[0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1E, 0x00, 0x00, 0x01]);

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].kind, NalKind::Sps);
        assert_eq!(units[0].type_code, 7);
        assert_eq!(units[0].payload.as_ref(), &[0x67, 0x42, 0x00, 0x1E]);
    }

    #[test]
    fn test_parse_4byte_start_code() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let mut data = annex_b(&[PPS]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);

        let units = demuxer.parse(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].kind, NalKind::Pps);
        assert_eq!(units[0].payload.as_ref(), PPS);
    }

    #[test]
    fn test_last_unit_waits_for_next_start_code() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);

        let units = demuxer.parse(&annex_b(&[SPS, PPS, IDR]));
        assert_eq!(payloads(&units), vec![SPS.to_vec(), PPS.to_vec()]);
        assert_eq!(demuxer.pending_len(), 4 + IDR.len());

        let units = demuxer.parse(&[0x00, 0x00, 0x00, 0x01, 0x09]);
        assert_eq!(payloads(&units), vec![IDR.to_vec()]);
        assert_eq!(units[0].kind, NalKind::Frame);
        assert_eq!(units[0].type_code, 5);
    }

    #[test]
    fn test_cache_populated_in_order() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let data = annex_b(&[SPS, PPS, IDR]);

        // SPS completes once the PPS start code arrives.
        demuxer.parse(&data[..4 + SPS.len() + 4]);
        assert_eq!(demuxer.cache().sps().map(|b| b.as_ref()), Some(SPS));
        assert!(demuxer.cache().pps().is_none());

        demuxer.parse(&data[4 + SPS.len() + 4..]);
        assert_eq!(demuxer.cache().pps().map(|b| b.as_ref()), Some(PPS));
        assert!(demuxer.cache().is_complete(VideoCodec::H264));
    }

    #[test]
    fn test_parse_each_sees_cache_in_stream_order() {
        let newer_pps: &[u8] = &[0x68, 0xEE, 0x01];
        let mut data = annex_b(&[SPS, PPS, IDR, newer_pps]);
        data.extend_from_slice(&[0x00, 0x00, 0x01]);

        let mut seen = Vec::new();
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        demuxer.parse_each(&data, |unit, cache| {
            seen.push((unit.kind, cache.pps().map(|p| p.to_vec())));
        });

        assert_eq!(
            seen,
            vec![
                (NalKind::Sps, None),
                (NalKind::Pps, Some(PPS.to_vec())),
                (NalKind::Frame, Some(PPS.to_vec())),
                (NalKind::Pps, Some(newer_pps.to_vec())),
            ]
        );
    }

    #[test]
    fn test_parameter_set_split_mid_start_code() {
        let mut data = annex_b(&[SPS, PPS]);
        data.extend_from_slice(&[0x00, 0x00, 0x01]);

        // Split inside the PPS start code.
        let split = 4 + SPS.len() + 2;
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let mut units = demuxer.parse(&data[..split]);
        units.extend(demuxer.parse(&data[split..]));

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, NalKind::Sps);
        assert_eq!(units[1].kind, NalKind::Pps);
        assert_eq!(units[1].payload.as_ref(), PPS);
    }

    #[test]
    fn test_parameter_set_split_mid_payload() {
        let mut data = annex_b(&[SPS, PPS]);
        data.extend_from_slice(&[0x00, 0x00, 0x01]);

        let split = 4 + 2;
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let mut units = demuxer.parse(&data[..split]);
        assert!(units.is_empty());
        units.extend(demuxer.parse(&data[split..]));

        assert_eq!(units[0].kind, NalKind::Sps);
        assert_eq!(units[0].payload.as_ref(), SPS);
        assert_eq!(units[1].kind, NalKind::Pps);
    }

    #[test]
    fn test_h265_classification() {
        let vps = [0x40, 0x01, 0x0C];
        let sps = [0x42, 0x01, 0x01];
        let pps = [0x44, 0x01, 0xC1];
        let idr = [0x26, 0x01, 0xAF];

        let mut data = annex_b(&[&vps, &sps, &pps, &idr]);
        data.extend_from_slice(&[0x00, 0x00, 0x01]);

        let mut demuxer = Demuxer::new(VideoCodec::H265);
        let units = demuxer.parse(&data);

        let kinds: Vec<_> = units.iter().map(|u| (u.type_code, u.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (32, NalKind::Vps),
                (33, NalKind::Sps),
                (34, NalKind::Pps),
                (19, NalKind::Frame),
            ]
        );
        assert!(demuxer.cache().is_complete(VideoCodec::H265));
    }

    #[test]
    fn test_h265_incomplete_without_vps() {
        let mut cache = ParameterSetCache::default();
        let sps = NalUnit::parse(VideoCodec::H265, Bytes::from_static(&[0x42, 0x01])).unwrap();
        let pps = NalUnit::parse(VideoCodec::H265, Bytes::from_static(&[0x44, 0x01])).unwrap();

        assert!(cache.store(&sps));
        assert!(cache.store(&pps));
        assert!(cache.is_complete(VideoCodec::H264));
        assert!(!cache.is_complete(VideoCodec::H265));
    }

    #[test]
    fn test_later_parameter_set_overwrites() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let newer_sps: &[u8] = &[0x67, 0x64, 0x00, 0x28];
        let mut data = annex_b(&[SPS, newer_sps]);
        data.extend_from_slice(&[0x00, 0x00, 0x01]);

        demuxer.parse(&data);
        assert_eq!(demuxer.cache().sps().map(|b| b.as_ref()), Some(newer_sps));
    }

    #[test]
    fn test_empty_spans_and_leading_garbage_dropped() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let mut data = vec![0xDE, 0xAD, 0xBE, 0xEF];
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x00, 0x01]);
        data.extend_from_slice(&annex_b(&[IDR]));
        data.extend_from_slice(&[0x00, 0x00, 0x01]);

        let units = demuxer.parse(&data);
        assert_eq!(payloads(&units), vec![IDR.to_vec()]);
        assert_eq!(demuxer.discarded_bytes(), 4);
    }

    #[test]
    fn test_no_start_code_keeps_only_tail() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        assert!(demuxer.parse(&[0x11, 0x22, 0x33, 0x00, 0x00, 0x00]).is_empty());
        assert_eq!(demuxer.pending_len(), 3);

        // The kept zeros become a start code with the next byte.
        let units = demuxer.parse(&[0x01, 0x65, 0xAA, 0x00, 0x00, 0x01]);
        assert_eq!(payloads(&units), vec![vec![0x65, 0xAA]]);
    }

    #[test]
    fn test_oversized_unit_resynchronizes() {
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let mut data = vec![0x00, 0x00, 0x00, 0x01, 0x65];
        data.resize(MAX_PENDING_BYTES + 16, 0xAB);

        assert!(demuxer.parse(&data).is_empty());
        assert_eq!(demuxer.pending_len(), START_CODE_TAIL);

        let mut next = annex_b(&[SPS]);
        next.extend_from_slice(&[0x00, 0x00, 0x01]);
        let units = demuxer.parse(&next);
        assert_eq!(payloads(&units), vec![SPS.to_vec()]);
    }

    #[test]
    fn test_large_unit_across_small_chunks() {
        let mut frame = vec![0x65];
        frame.resize(64 * 1024, 0xAB);
        let mut data = annex_b(&[SPS, &frame]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);

        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let mut units = Vec::new();
        for chunk in data.chunks(7) {
            units.extend(demuxer.parse(chunk));
            assert!(demuxer.scan_from <= demuxer.pending_len());
        }

        assert_eq!(payloads(&units), vec![SPS.to_vec(), frame]);
        assert_eq!(demuxer.pending_len(), 4);
    }

    #[test]
    fn test_four_byte_code_split_after_partial_scan() {
        let frame: &[u8] = &[0x65, 0x88, 0x84];
        let mut demuxer = Demuxer::new(VideoCodec::H264);
        let mut head = annex_b(&[frame]);
        head.extend_from_slice(&[0x00, 0x00]);

        assert!(demuxer.parse(&head).is_empty());
        assert_eq!(demuxer.scan_from, head.len() - START_CODE_TAIL);

        let units = demuxer.parse(&[0x00, 0x01, 0x09]);
        assert_eq!(payloads(&units), vec![frame.to_vec()]);
        assert_eq!(demuxer.scan_from, 4 + 1 - START_CODE_TAIL);
    }

    #[test]
    fn test_to_length_prefixed() {
        let sample = to_length_prefixed(&[0x65, 0x88, 0x84]);
        assert_eq!(sample.as_ref(), &[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x84]);
    }

    fn stream_strategy() -> impl Strategy<Value = Vec<u8>> {
        // Small alphabet so start codes and near-misses are common.
        prop::collection::vec(
            prop_oneof![Just(0x00u8), Just(0x01u8), Just(0x67u8), Just(0x65u8), any::<u8>()],
            0..512,
        )
    }

    proptest! {
        #[test]
        fn prop_chunking_invariance(
            stream in stream_strategy(),
            cuts in prop::collection::vec(1usize..32, 0..64),
        ) {
            let mut whole = Demuxer::new(VideoCodec::H264);
            let expected = payloads(&whole.parse(&stream));

            let mut chunked = Demuxer::new(VideoCodec::H264);
            let mut actual = Vec::new();
            let mut rest: &[u8] = &stream;
            for cut in cuts {
                let n = cut.min(rest.len());
                let (head, tail) = rest.split_at(n);
                actual.extend(payloads(&chunked.parse(head)));
                rest = tail;
            }
            actual.extend(payloads(&chunked.parse(rest)));

            prop_assert_eq!(&actual, &expected);
            prop_assert_eq!(chunked.cache(), whole.cache());
        }
    }
}
