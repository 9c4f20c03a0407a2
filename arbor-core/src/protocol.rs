//! Arbor wire protocol: opcodes, message variants and the packet envelope.

use std::collections::BTreeMap;
use std::fmt;

use crate::identity::Identity;
use crate::sensors::SensorId;
use crate::wire::{FrameDecodeError, FrameEncodeError, FrameReader, FrameWriter};

/// Id of a registered endpoint as handed out by the account resolver. Zero is reserved.
pub type EndpointId = u32;

/// One-byte discriminator selecting the message variant.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum OpCode {
    RegistrationRequest = 0,
    RegistrationResponse = 1,
    SensorData = 2,
    SensorDataRequest = 3,
    GenericError = 4,
    Acknowledgement = 5,
    AvailableEndpoints = 6,
}

impl OpCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A message variant: fixed opcode plus symmetric field encoding.
/// `build` and `extract` must visit the fields in the same order.
pub trait Variant: Sized + Into<Message> {
    const OPCODE: OpCode;

    fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError>;

    fn extract(r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError>;
}

/// Decodes the payload of one variant.
pub type Extractor = fn(&mut FrameReader<'_>) -> Result<Message, FrameDecodeError>;

fn extract_as<V: Variant>(r: &mut FrameReader<'_>) -> Result<Message, FrameDecodeError> {
    V::extract(r).map(Into::into)
}

/// Opcode to decoder. Adding a variant means adding a row here.
const DISPATCH: [(OpCode, Extractor); 7] = [
    (OpCode::RegistrationRequest, extract_as::<RegistrationRequest>),
    (OpCode::RegistrationResponse, extract_as::<RegistrationResponse>),
    (OpCode::SensorData, extract_as::<SensorData>),
    (OpCode::SensorDataRequest, extract_as::<SensorDataRequest>),
    (OpCode::GenericError, extract_as::<GenericError>),
    (OpCode::Acknowledgement, extract_as::<Acknowledgement>),
    (OpCode::AvailableEndpoints, extract_as::<AvailableEndpoints>),
];

/// Look up the decoder registered for `opcode`.
pub fn extractor(opcode: u8) -> Option<Extractor> {
    DISPATCH
        .iter()
        .find(|(code, _)| code.as_byte() == opcode)
        .map(|(_, extract)| *extract)
}

/// All wire message types.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RegistrationRequest(RegistrationRequest),
    RegistrationResponse(RegistrationResponse),
    SensorData(SensorData),
    SensorDataRequest(SensorDataRequest),
    GenericError(GenericError),
    Acknowledgement(Acknowledgement),
    AvailableEndpoints(AvailableEndpoints),
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::RegistrationRequest(_) => RegistrationRequest::OPCODE,
            Message::RegistrationResponse(_) => RegistrationResponse::OPCODE,
            Message::SensorData(_) => SensorData::OPCODE,
            Message::SensorDataRequest(_) => SensorDataRequest::OPCODE,
            Message::GenericError(_) => GenericError::OPCODE,
            Message::Acknowledgement(_) => Acknowledgement::OPCODE,
            Message::AvailableEndpoints(_) => AvailableEndpoints::OPCODE,
        }
    }

    pub(crate) fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        match self {
            Message::RegistrationRequest(m) => m.build(w),
            Message::RegistrationResponse(m) => m.build(w),
            Message::SensorData(m) => m.build(w),
            Message::SensorDataRequest(m) => m.build(w),
            Message::GenericError(m) => m.build(w),
            Message::Acknowledgement(m) => m.build(w),
            Message::AvailableEndpoints(m) => m.build(w),
        }
    }
}

macro_rules! impl_into_message {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Message {
                fn from(m: $variant) -> Self {
                    Message::$variant(m)
                }
            }
        )*
    };
}

impl_into_message!(
    RegistrationRequest,
    RegistrationResponse,
    SensorData,
    SensorDataRequest,
    GenericError,
    Acknowledgement,
    AvailableEndpoints,
);

/// A message plus its broadcast flag: what one frame carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    message: Message,
    broadcast: bool,
}

impl Packet {
    /// Unicast packet.
    pub fn new(message: impl Into<Message>) -> Self {
        Self {
            message: message.into(),
            broadcast: false,
        }
    }

    pub fn opcode(&self) -> OpCode {
        self.message.opcode()
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        self.broadcast = broadcast;
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

impl From<Message> for Packet {
    fn from(message: Message) -> Self {
        Packet::new(message)
    }
}

/// Leaf asks the stem to be registered under a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub identity: Identity,
}

impl RegistrationRequest {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

impl Variant for RegistrationRequest {
    const OPCODE: OpCode = OpCode::RegistrationRequest;

    fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        w.put_u8(self.identity.as_byte())
    }

    fn extract(r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError> {
        let identity = Identity::from_byte(r.get_u8()?)
            .ok_or(FrameDecodeError::Malformed("unknown leaf identity"))?;
        Ok(Self { identity })
    }
}

/// Sent by a dedicated worker once it is ready to service the leaf.
/// The worker's address is the datagram source, not a payload field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResponse {
    pub accepted: bool,
    pub detail: String,
}

impl RegistrationResponse {
    pub fn accepted(detail: impl Into<String>) -> Self {
        Self {
            accepted: true,
            detail: detail.into(),
        }
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        Self {
            accepted: false,
            detail: detail.into(),
        }
    }
}

impl Variant for RegistrationResponse {
    const OPCODE: OpCode = OpCode::RegistrationResponse;

    fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        w.put_bool(self.accepted)?;
        w.put_str(&self.detail)
    }

    fn extract(r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError> {
        let accepted = r.get_bool()?;
        let detail = r.get_str()?;
        Ok(Self { accepted, detail })
    }
}

/// Latest readings of a sensor endpoint, keyed by well-known sensor id.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorData {
    readings: BTreeMap<SensorId, f64>,
}

impl SensorData {
    /// Every supported sensor at the default reading.
    pub fn new() -> Self {
        let readings = SensorId::ALL
            .iter()
            .map(|&id| (id, SensorId::DEFAULT_READING))
            .collect();
        Self { readings }
    }

    /// No readings at all.
    pub fn empty() -> Self {
        Self {
            readings: BTreeMap::new(),
        }
    }

    /// Store a reading by raw sensor id. Returns false (and stores nothing) for unsupported ids.
    pub fn add_sensor_data(&mut self, sensor_id: u8, value: f64) -> bool {
        match SensorId::from_byte(sensor_id) {
            Some(id) => {
                self.set(id, value);
                true
            }
            None => false,
        }
    }

    pub fn set(&mut self, id: SensorId, value: f64) {
        self.readings.insert(id, value);
    }

    /// Reading for a raw sensor id, or the default reading when absent.
    pub fn sensor_data(&self, sensor_id: u8) -> f64 {
        SensorId::from_byte(sensor_id)
            .and_then(|id| self.get(id))
            .unwrap_or(SensorId::DEFAULT_READING)
    }

    pub fn get(&self, id: SensorId) -> Option<f64> {
        self.readings.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (SensorId, f64)> + '_ {
        self.readings.iter().map(|(&id, &v)| (id, v))
    }
}

impl Default for SensorData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (id, value) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}: {:.2}", id, value)?;
            first = false;
        }
        Ok(())
    }
}

impl Variant for SensorData {
    const OPCODE: OpCode = OpCode::SensorData;

    fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        for (id, value) in self.iter() {
            w.put_u8(id.as_byte())?;
            w.put_f64(value)?;
        }
        Ok(())
    }

    fn extract(r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError> {
        let mut data = Self::empty();
        // Entries run until the zero padding (or the end of the payload).
        while let Some(raw) = r.peek_u8() {
            if raw == 0 {
                break;
            }
            r.get_u8()?;
            let id = SensorId::from_byte(raw)
                .ok_or(FrameDecodeError::Malformed("unsupported sensor id"))?;
            let value = r.get_f64()?;
            data.set(id, value);
        }
        Ok(data)
    }
}

/// Mobile user asks for the latest readings, optionally of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SensorDataRequest {
    pub target: Option<EndpointId>,
}

impl SensorDataRequest {
    pub fn any() -> Self {
        Self { target: None }
    }

    pub fn for_endpoint(id: EndpointId) -> Self {
        Self { target: Some(id) }
    }
}

impl Variant for SensorDataRequest {
    const OPCODE: OpCode = OpCode::SensorDataRequest;

    fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        match self.target {
            Some(0) => Err(FrameEncodeError::InvalidField("endpoint id 0 is reserved")),
            Some(id) => w.put_u32(id),
            None => w.put_u32(0),
        }
    }

    fn extract(r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError> {
        let target = match r.get_u32()? {
            0 => None,
            id => Some(id),
        };
        Ok(Self { target })
    }
}

/// Well-known error ids carried by [`GenericError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Registration request from a leaf that already has a worker.
    AlreadyRegistered,
    /// The receiver did not expect this packet type.
    WrongPacket,
    Other(u8),
}

impl ErrorCode {
    pub fn as_byte(self) -> u8 {
        match self {
            ErrorCode::AlreadyRegistered => 0,
            ErrorCode::WrongPacket => 1,
            ErrorCode::Other(b) => b,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => ErrorCode::AlreadyRegistered,
            1 => ErrorCode::WrongPacket,
            b => ErrorCode::Other(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericError {
    pub code: ErrorCode,
    pub message: String,
}

impl GenericError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for GenericError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error {}: {}", self.code.as_byte(), self.message)
    }
}

impl Variant for GenericError {
    const OPCODE: OpCode = OpCode::GenericError;

    fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        w.put_u8(self.code.as_byte())?;
        w.put_str(&self.message)
    }

    fn extract(r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError> {
        let code = ErrorCode::from_byte(r.get_u8()?);
        let message = r.get_str()?;
        Ok(Self { code, message })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Acknowledgement;

impl Variant for Acknowledgement {
    const OPCODE: OpCode = OpCode::Acknowledgement;

    fn build(&self, _w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        Ok(())
    }

    fn extract(_r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError> {
        Ok(Acknowledgement)
    }
}

/// Endpoints currently reporting to the stem: id to display name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AvailableEndpoints {
    endpoints: BTreeMap<EndpointId, String>,
}

impl AvailableEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: EndpointId, name: impl Into<String>) -> Option<String> {
        self.endpoints.insert(id, name.into())
    }

    pub fn get(&self, id: EndpointId) -> Option<&str> {
        self.endpoints.get(&id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (EndpointId, &str)> + '_ {
        self.endpoints.iter().map(|(&id, name)| (id, name.as_str()))
    }
}

impl Variant for AvailableEndpoints {
    const OPCODE: OpCode = OpCode::AvailableEndpoints;

    fn build(&self, w: &mut FrameWriter) -> Result<(), FrameEncodeError> {
        for (id, name) in self.iter() {
            if id == 0 {
                return Err(FrameEncodeError::InvalidField("endpoint id 0 is reserved"));
            }
            w.put_u32(id)?;
            w.put_str(name)?;
        }
        Ok(())
    }

    fn extract(r: &mut FrameReader<'_>) -> Result<Self, FrameDecodeError> {
        let mut out = Self::new();
        while r.remaining() >= 4 {
            let id = r.get_u32()?;
            if id == 0 {
                break;
            }
            let name = r.get_str()?;
            out.insert(id, name);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::encoded_len;

    #[test]
    fn opcodes_match_wire_table() {
        assert_eq!(OpCode::RegistrationRequest.as_byte(), 0);
        assert_eq!(OpCode::RegistrationResponse.as_byte(), 1);
        assert_eq!(OpCode::SensorData.as_byte(), 2);
        assert_eq!(OpCode::SensorDataRequest.as_byte(), 3);
        assert_eq!(OpCode::GenericError.as_byte(), 4);
        assert_eq!(OpCode::Acknowledgement.as_byte(), 5);
        assert_eq!(OpCode::AvailableEndpoints.as_byte(), 6);
    }

    #[test]
    fn dispatch_table_covers_every_opcode() {
        for code in 0..=6u8 {
            assert!(extractor(code).is_some(), "no decoder for opcode {}", code);
        }
        assert!(extractor(7).is_none());
        assert!(extractor(0xFF).is_none());
    }

    #[test]
    fn sensor_data_has_the_right_opcode() {
        assert_eq!(Packet::new(SensorData::new()).opcode(), OpCode::SensorData);
    }

    #[test]
    fn sensor_data_starts_at_default_readings() {
        let data = SensorData::new();
        assert_eq!(data.len(), SensorId::ALL.len());
        for id in SensorId::ALL {
            assert_eq!(data.sensor_data(id.as_byte()), -1.0);
        }
    }

    #[test]
    fn sensor_values_can_be_updated() {
        let mut data = SensorData::new();
        assert!(data.add_sensor_data(1, 5.0));
        assert!(data.add_sensor_data(2, 6.0));
        assert!(data.add_sensor_data(3, 7.0));
        assert!(data.add_sensor_data(4, 8.0));
        assert_eq!(data.sensor_data(1), 5.0);
        assert_eq!(data.sensor_data(2), 6.0);
        assert_eq!(data.sensor_data(3), 7.0);
        assert_eq!(data.sensor_data(4), 8.0);
        assert_eq!(data.len(), 4);
    }

    #[test]
    fn unsupported_sensor_rejected() {
        let mut data = SensorData::new();
        assert!(!data.add_sensor_data(10, 5.0));
        assert!(!data.add_sensor_data(0, 5.0));
        assert_eq!(data.len(), SensorId::ALL.len());
    }

    #[test]
    fn absent_sensor_reads_sentinel() {
        let mut data = SensorData::new();
        assert_eq!(data.sensor_data(10), -1.0);
        data.clear();
        assert_eq!(data.len(), 0);
        assert!(data.is_empty());
        assert_eq!(data.sensor_data(SensorId::AirHumidity.as_byte()), -1.0);
    }

    #[test]
    fn each_reading_takes_nine_bytes() {
        let mut data = SensorData::empty();
        let before = encoded_len(&data.clone().into()).unwrap();
        assert!(data.add_sensor_data(SensorId::LightIntensity.as_byte(), 5.0));
        let after = encoded_len(&data.into()).unwrap();
        assert_eq!(after - before, 9);
    }

    #[test]
    fn reserved_endpoint_id_rejected() {
        let err = encoded_len(&SensorDataRequest { target: Some(0) }.into()).unwrap_err();
        assert!(matches!(err, FrameEncodeError::InvalidField(_)));

        let mut endpoints = AvailableEndpoints::new();
        endpoints.insert(0, "nobody");
        assert!(encoded_len(&endpoints.into()).is_err());
    }

    #[test]
    fn sensor_data_display() {
        let mut data = SensorData::empty();
        data.set(SensorId::AirTemperature, 21.5);
        assert_eq!(data.to_string(), "Temperature: 21.50");
    }
}
