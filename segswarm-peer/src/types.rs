use std::{collections::HashMap, fmt, sync::Arc};

use crate::linked_map::LinkedMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; `end` is inclusive.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// A media segment descriptor, produced by the manifest layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Segment {
    /// Key within the owning stream's registry.
    pub local_id: String,
    /// Identity shared by every peer in the swarm.
    pub external_id: String,
    /// Local id of the owning stream.
    pub stream_id: String,
    pub byte_range: Option<ByteRange>,
}

impl Segment {
    pub fn new(
        local_id: impl Into<String>,
        external_id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Segment {
        Segment {
            local_id: local_id.into(),
            external_id: external_id.into(),
            stream_id: stream_id.into(),
            byte_range: None,
        }
    }

    pub fn with_byte_range(mut self, byte_range: ByteRange) -> Segment {
        self.byte_range = Some(byte_range);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Video => write!(f, "video"),
            StreamKind::Audio => write!(f, "audio"),
        }
    }
}

/// One rendition of a stream, with its segments in playlist order.
#[derive(Clone, Debug)]
pub struct Stream {
    pub local_id: String,
    pub kind: StreamKind,
    pub index: u32,
    segments: LinkedMap<String, Arc<Segment>>,
}

impl Stream {
    pub fn new(local_id: impl Into<String>, kind: StreamKind, index: u32) -> Stream {
        Stream {
            local_id: local_id.into(),
            kind,
            index,
            segments: LinkedMap::new(),
        }
    }

    /// Identity of this rendition across sessions, derived from the manifest
    /// it was loaded from.
    pub fn external_id(&self, manifest_url: &str) -> String {
        format!("{}-{}-{}", manifest_url, self.kind, self.index)
    }

    /// Append a segment to the end of the playlist, returning the shared
    /// descriptor. The segment's stream id is set to this stream.
    pub fn push_segment(&mut self, mut segment: Segment) -> Arc<Segment> {
        segment.stream_id = self.local_id.clone();
        let segment = Arc::new(segment);
        self.segments
            .push_back(segment.local_id.clone(), segment.clone());
        segment
    }

    pub fn remove_segment(&mut self, local_id: &str) -> Option<Arc<Segment>> {
        self.segments.remove(local_id)
    }

    pub fn segment(&self, local_id: &str) -> Option<&Arc<Segment>> {
        self.segments.get(local_id)
    }

    pub fn segment_by_external_id(&self, external_id: &str) -> Option<&Arc<Segment>> {
        self.segments
            .values()
            .find(|segment| segment.external_id == external_id)
    }

    pub fn next_segment(&self, local_id: &str) -> Option<&Arc<Segment>> {
        self.segments.next_to(local_id).map(|(_, s)| s)
    }

    pub fn prev_segment(&self, local_id: &str) -> Option<&Arc<Segment>> {
        self.segments.prev_to(local_id).map(|(_, s)| s)
    }

    /// Segments from `local_id` onwards, in playlist order.
    pub fn segments_from<'a>(&'a self, local_id: &str) -> impl Iterator<Item = &'a Arc<Segment>> {
        self.segments.iter_from(local_id).map(|(_, s)| s)
    }

    pub fn segments(&self) -> impl Iterator<Item = &Arc<Segment>> {
        self.segments.values()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// What a remote peer claims about one segment. A segment missing from the
/// peer's map is unknown, not absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSegmentStatus {
    Loaded,
    LoadingViaFallback,
}

/// A full snapshot of which segments a peer holds or is fetching over the
/// fallback path. Always replaces the receiver's previous view of the sender.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentAnnouncement {
    pub loaded: Vec<String>,
    pub loading_via_fallback: Vec<String>,
}

impl SegmentAnnouncement {
    /// Per-segment status map. An id listed as both loaded and loading is
    /// treated as loaded.
    pub fn statuses(&self) -> HashMap<String, PeerSegmentStatus> {
        let mut statuses = HashMap::with_capacity(self.loaded.len() + self.loading_via_fallback.len());
        for id in self.loading_via_fallback.iter() {
            statuses.insert(id.clone(), PeerSegmentStatus::LoadingViaFallback);
        }
        for id in self.loaded.iter() {
            statuses.insert(id.clone(), PeerSegmentStatus::Loaded);
        }
        statuses
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty() && self.loading_via_fallback.is_empty()
    }
}
