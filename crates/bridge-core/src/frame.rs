use bytes::Bytes;

/// Header fields common to every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    /// Binding which originated the stream (passed through, uninterpreted).
    pub origin_id: u64,
    /// Binding to which the stream is routed (passed through, uninterpreted).
    pub routed_id: u64,
    /// Stream of this frame. Initial streams are odd, and replies are even.
    pub stream_id: u64,
    pub sequence: u64,
    pub acknowledge: u64,
    pub maximum: u32,
    pub trace_id: u64,
    pub authorization: u64,
}

/// Fragmentation flags of a Data frame.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DataFlags(pub u8);

impl DataFlags {
    pub const CONTINUATION: Self = Self(0x00);
    pub const FIN: Self = Self(0x01);
    pub const INIT: Self = Self(0x02);
    pub const COMPLETE: Self = Self(0x03);

    /// Is this the first fragment of a message?
    #[inline]
    pub fn is_init(self) -> bool {
        self.0 & Self::INIT.0 != 0
    }
    /// Is this the last fragment of a message?
    #[inline]
    pub fn is_fin(self) -> bool {
        self.0 & Self::FIN.0 != 0
    }
    #[inline]
    pub fn without_init(self) -> Self {
        Self(self.0 & !Self::INIT.0)
    }
    #[inline]
    pub fn without_fin(self) -> Self {
        Self(self.0 & !Self::FIN.0)
    }
}

impl std::fmt::Debug for DataFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.is_init(), self.is_fin()) {
            (true, true) => f.write_str("COMPLETE"),
            (true, false) => f.write_str("INIT"),
            (false, true) => f.write_str("FIN"),
            (false, false) => f.write_str("CONTINUATION"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Begin<X> {
    pub header: Header,
    pub affinity: u64,
    pub extension: Option<X>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data<X> {
    pub header: Header,
    pub budget_id: u64,
    pub flags: DataFlags,
    pub reserved: u32,
    pub payload: Option<Bytes>,
    pub extension: Option<X>,
}

impl<X> Data<X> {
    /// Length of the payload, where an absent payload is empty.
    #[inline]
    pub fn length(&self) -> usize {
        self.payload.as_ref().map(Bytes::len).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct End<X> {
    pub header: Header,
    pub extension: Option<X>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Abort<X> {
    pub header: Header,
    pub extension: Option<X>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Flush<X> {
    pub header: Header,
    pub budget_id: u64,
    pub reserved: u32,
    pub extension: Option<X>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub header: Header,
    pub budget_id: u64,
    pub padding: u32,
    pub capabilities: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reset<X> {
    pub header: Header,
    pub extension: Option<X>,
}

/// Frame is one of the seven stream lifecycle events,
/// carrying protocol extensions of type X.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<X> {
    Begin(Begin<X>),
    Data(Data<X>),
    End(End<X>),
    Abort(Abort<X>),
    Flush(Flush<X>),
    Window(Window),
    Reset(Reset<X>),
}

impl<X> Frame<X> {
    pub fn header(&self) -> &Header {
        match self {
            Frame::Begin(f) => &f.header,
            Frame::Data(f) => &f.header,
            Frame::End(f) => &f.header,
            Frame::Abort(f) => &f.header,
            Frame::Flush(f) => &f.header,
            Frame::Window(f) => &f.header,
            Frame::Reset(f) => &f.header,
        }
    }

    #[inline]
    pub fn stream_id(&self) -> u64 {
        self.header().stream_id
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Begin(_) => "begin",
            Frame::Data(_) => "data",
            Frame::End(_) => "end",
            Frame::Abort(_) => "abort",
            Frame::Flush(_) => "flush",
            Frame::Window(_) => "window",
            Frame::Reset(_) => "reset",
        }
    }
}

/// Is `stream_id` an initial (client-to-server) stream?
#[inline]
pub fn is_initial(stream_id: u64) -> bool {
    stream_id & 0x01 != 0
}
