//! INDI XML transport over TCP
//!
//! Parses the server's XML stream into [`TransportEvent`]s and writes
//! `new*Vector` requests. Every device seen for the first time gets an
//! `enableBLOB Also` so images are delivered to the client.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::Mutex;
use quick_xml::events::{BytesStart, Event};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{switch_value, INDI_PROTOCOL_VERSION};
use crate::transport::{ElementSnapshot, PropertyVector, Transport, TransportEvent};
use crate::{IndiError, IndiResult, NewPropertyItem, PropertyState, PropertyType};

/// INDI XML protocol client transport
#[derive(Default)]
pub struct XmlTransport {
    connected: Arc<AtomicBool>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl XmlTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn send_command(&self, command: String) -> IndiResult<()> {
        let tx = self.writer.lock().clone().ok_or(IndiError::NotConnected)?;
        tx.send(command)
            .await
            .map_err(|e| IndiError::ChannelClosed(e.to_string()))
    }

    /// Writer task - sends commands to INDI server
    async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
        while let Some(cmd) = rx.recv().await {
            if let Err(e) = writer.write_all(cmd.as_bytes()).await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
            if let Err(e) = writer.write_all(b"\n").await {
                tracing::error!("INDI write error: {}", e);
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for XmlTransport {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        events: mpsc::Sender<TransportEvent>,
    ) -> IndiResult<()> {
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            IndiError::ConnectionFailed(format!(
                "Failed to connect to INDI server at {}: {}. Check that the server is running and the address is correct.",
                addr, e
            ))
        })?;
        let (read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel::<String>(100);
        *self.writer.lock() = Some(tx.clone());
        self.connected.store(true, Ordering::SeqCst);

        let writer = tokio::spawn(Self::writer_task(write_half, rx));
        let connected = self.connected.clone();
        let reader = tokio::spawn(async move {
            if let Err(e) = read_stream(read_half, events.clone(), Some(tx)).await {
                tracing::error!("INDI reader stopped: {}", e);
            }
            connected.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::ServerDisconnected).await;
        });
        {
            let mut tasks = self.tasks.lock();
            tasks.push(writer);
            tasks.push(reader);
        }

        self.send_command(format!(
            "<getProperties version=\"{}\"/>",
            INDI_PROTOCOL_VERSION
        ))
        .await
    }

    async fn disconnect(&self) -> IndiResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_new_property(&self, request: &NewPropertyItem) -> IndiResult<()> {
        self.send_command(request_xml(request)?).await
    }

    async fn connect_device(&self, device: &str) -> IndiResult<()> {
        let request = NewPropertyItem::switch_on(device, "CONNECTION", "CONNECT")
            .with_element("DISCONNECT", switch_value::OFF);
        self.send_new_property(&request).await
    }

    async fn disconnect_device(&self, device: &str) -> IndiResult<()> {
        let request = NewPropertyItem::switch_on(device, "CONNECTION", "DISCONNECT")
            .with_element("CONNECT", switch_value::OFF);
        self.send_new_property(&request).await
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Encode a request as one `new*Vector` message
pub(crate) fn request_xml(request: &NewPropertyItem) -> IndiResult<String> {
    let kind = match request.property_type {
        PropertyType::Number => "Number",
        PropertyType::Switch => "Switch",
        PropertyType::Text => "Text",
        other => {
            return Err(IndiError::InvalidRequest(format!(
                "cannot send {} properties",
                other.type_tag()
            )))
        }
    };
    let elements: String = request
        .elements
        .iter()
        .map(|e| {
            let value = if request.property_type == PropertyType::Switch {
                if e.value.eq_ignore_ascii_case(switch_value::ON) {
                    "On".to_string()
                } else {
                    "Off".to_string()
                }
            } else {
                quick_xml::escape::escape(e.value.as_str()).into_owned()
            };
            format!(
                "<one{kind} name=\"{}\">{}</one{kind}>",
                quick_xml::escape::escape(e.element.as_str()),
                value,
                kind = kind
            )
        })
        .collect();
    Ok(format!(
        "<new{kind}Vector device=\"{}\" name=\"{}\">{}</new{kind}Vector>",
        quick_xml::escape::escape(request.device.as_str()),
        quick_xml::escape::escape(request.property.as_str()),
        elements,
        kind = kind
    ))
}

// =============================================================================
// DECODING
// =============================================================================

/// Element being parsed
#[derive(Debug, Default)]
struct PendingElement {
    name: String,
    label: String,
    format: String,
    value: String,
    blob_format: Option<String>,
}

/// Vector being parsed
struct PendingVector {
    vector: PropertyVector,
    definition: bool,
}

fn property_type_of(tag: &str) -> PropertyType {
    if tag.contains("Switch") {
        PropertyType::Switch
    } else if tag.contains("Number") {
        PropertyType::Number
    } else if tag.contains("Light") {
        PropertyType::Light
    } else if tag.contains("BLOB") {
        PropertyType::Blob
    } else {
        PropertyType::Text
    }
}

/// Read INDI XML until EOF, forwarding events. `commands` receives the
/// `enableBLOB` requests for new devices.
pub(crate) async fn read_stream<R: AsyncRead + Unpin>(
    reader: R,
    events: mpsc::Sender<TransportEvent>,
    commands: Option<mpsc::Sender<String>>,
) -> IndiResult<()> {
    let mut reader = quick_xml::reader::Reader::from_reader(tokio::io::BufReader::new(reader));
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut known_devices: HashSet<String> = HashSet::new();
    let mut vector: Option<PendingVector> = None;
    let mut element: Option<PendingElement> = None;

    loop {
        let mut out: Vec<TransportEvent> = Vec::new();
        match reader.read_event_into_async(&mut buf).await {
            Ok(Event::Start(e)) => {
                start_tag(&e, &mut vector, &mut element, &mut known_devices, &mut out, &commands)
                    .await;
            }
            Ok(Event::Empty(e)) => {
                start_tag(&e, &mut vector, &mut element, &mut known_devices, &mut out, &commands)
                    .await;
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                end_tag(&name, &mut vector, &mut element, &mut out);
            }
            Ok(Event::Text(e)) => {
                if let Some(pending) = element.as_mut() {
                    let text = e.unescape().unwrap_or_default();
                    pending.value.push_str(&text);
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                end_tag(&name, &mut vector, &mut element, &mut out);
            }
            Ok(Event::Eof) => {
                tracing::info!("INDI connection closed (EOF)");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(
                    "INDI XML parse error: {}. Raw buffer (first 200 chars): {:?}",
                    e,
                    String::from_utf8_lossy(&buf[..buf.len().min(200)])
                );
                if matches!(e, quick_xml::Error::Io(_)) {
                    return Err(IndiError::Io(e.to_string()));
                }
            }
            _ => {}
        }
        buf.clear();

        for event in out {
            if events.send(event).await.is_err() {
                return Err(IndiError::ChannelClosed("event consumer stopped".into()));
            }
        }
    }
}

async fn start_tag(
    e: &BytesStart<'_>,
    vector: &mut Option<PendingVector>,
    element: &mut Option<PendingElement>,
    known_devices: &mut HashSet<String>,
    out: &mut Vec<TransportEvent>,
    commands: &Option<mpsc::Sender<String>>,
) {
    let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let is_vector = tag.ends_with("Vector");

    if is_vector && (tag.starts_with("def") || tag.starts_with("set")) {
        let (Some(device), Some(name)) = (get_attribute(e, "device"), get_attribute(e, "name"))
        else {
            return;
        };
        let definition = tag.starts_with("def");
        if definition && known_devices.insert(device.clone()) {
            out.push(TransportEvent::DeviceAdded {
                device: device.clone(),
            });
            if let Some(commands) = commands {
                let _ = commands
                    .send(format!(
                        "<enableBLOB device=\"{}\">Also</enableBLOB>",
                        quick_xml::escape::escape(device.as_str())
                    ))
                    .await;
            }
        }
        if let Some(message) = get_attribute(e, "message") {
            out.push(TransportEvent::ServerMessage {
                device: device.clone(),
                message,
            });
        }

        let mut pending = PropertyVector::new(&device, &name, property_type_of(&tag));
        pending.state = get_attribute(e, "state").map(|s| parse_state(&s));
        if definition && pending.state.is_none() {
            pending.state = Some(PropertyState::Idle);
        }
        pending.label = get_attribute(e, "label").unwrap_or_default();
        pending.group = get_attribute(e, "group").unwrap_or_default();
        *vector = Some(PendingVector {
            vector: pending,
            definition,
        });
    } else if !is_vector && (tag.starts_with("def") || tag.starts_with("one")) && vector.is_some() {
        let mut pending = PendingElement {
            name: get_attribute(e, "name").unwrap_or_default(),
            label: get_attribute(e, "label").unwrap_or_default(),
            format: get_attribute(e, "format").unwrap_or_default(),
            ..Default::default()
        };
        if tag == "oneBLOB" {
            pending.blob_format = Some(pending.format.clone());
            pending.format.clear();
        }
        *element = Some(pending);
    } else if tag == "delProperty" {
        let Some(device) = get_attribute(e, "device") else {
            return;
        };
        match get_attribute(e, "name") {
            Some(name) => out.push(TransportEvent::PropertyRemoved {
                device,
                property: Some(name),
            }),
            None => {
                known_devices.remove(&device);
                out.push(TransportEvent::DeviceRemoved { device });
            }
        }
    } else if tag == "message" {
        if let Some(message) = get_attribute(e, "message") {
            out.push(TransportEvent::ServerMessage {
                device: get_attribute(e, "device").unwrap_or_default(),
                message,
            });
        }
    }
}

fn end_tag(
    tag: &str,
    vector: &mut Option<PendingVector>,
    element: &mut Option<PendingElement>,
    out: &mut Vec<TransportEvent>,
) {
    if tag.ends_with("Vector") {
        if let Some(done) = vector.take() {
            out.push(if done.definition {
                TransportEvent::PropertyDefined(done.vector)
            } else {
                TransportEvent::PropertyUpdated(done.vector)
            });
        }
        *element = None;
        return;
    }
    if !(tag.starts_with("def") || tag.starts_with("one")) {
        return;
    }
    let (Some(done), Some(current)) = (element.take(), vector.as_mut()) else {
        return;
    };

    if let Some(blob_format) = done.blob_format {
        let payload: String = done.value.split_whitespace().collect();
        if !payload.is_empty() {
            match BASE64.decode(payload.as_bytes()) {
                Ok(data) => out.push(TransportEvent::BlobReceived {
                    device: current.vector.device.clone(),
                    property: current.vector.name.clone(),
                    element: done.name.clone(),
                    format: blob_format,
                    data,
                }),
                Err(e) => tracing::warn!(
                    "Failed to decode BLOB base64 for {}.{}.{}: {}",
                    current.vector.device,
                    current.vector.name,
                    done.name,
                    e
                ),
            }
        }
        current.vector.elements.push(ElementSnapshot::new(&done.name, ""));
        return;
    }

    current.vector.elements.push(ElementSnapshot {
        name: done.name,
        label: done.label,
        value: done.value.trim().to_string(),
        format: done.format,
    });
}

/// Helper to get attribute from XML event
fn get_attribute(e: &BytesStart, name: &str) -> Option<String> {
    e.attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name.as_bytes())
        .map(|a| {
            a.unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).to_string())
        })
}

fn parse_state(s: &str) -> PropertyState {
    match s {
        "Idle" => PropertyState::Idle,
        "Ok" => PropertyState::Ok,
        "Busy" => PropertyState::Busy,
        "Alert" => PropertyState::Alert,
        _ => PropertyState::Idle,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse(xml: &str) -> Vec<TransportEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        read_stream(xml.as_bytes(), tx, None).await.unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_definition_creates_device_then_vector() {
        let events = parse(
            r#"<defNumberVector device="Telescope Simulator" name="EQUATORIAL_EOD_COORD" label="Eq. Coordinates" group="Main Control" state="Ok" perm="rw">
                <defNumber name="RA" label="RA (hh:mm:ss)" format="%010.6m" min="0" max="24" step="0">5.5</defNumber>
                <defNumber name="DEC" label="DEC (dd:mm:ss)" format="%010.6m" min="-90" max="90" step="0">-12.25</defNumber>
            </defNumberVector>"#,
        )
        .await;

        assert_eq!(
            events[0],
            TransportEvent::DeviceAdded {
                device: "Telescope Simulator".to_string()
            }
        );
        match &events[1] {
            TransportEvent::PropertyDefined(vector) => {
                assert_eq!(vector.property_type, PropertyType::Number);
                assert_eq!(vector.state, Some(PropertyState::Ok));
                assert_eq!(vector.group, "Main Control");
                assert_eq!(vector.elements.len(), 2);
                assert_eq!(vector.elements[0].value, "5.5");
                assert_eq!(vector.elements[0].format, "%010.6m");
                assert_eq!(vector.elements[1].label, "DEC (dd:mm:ss)");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_message_and_removal() {
        let events = parse(
            r#"<setSwitchVector device="CCD Simulator" name="CONNECTION" state="Alert" message="Port busy">
                <oneSwitch name="CONNECT">Off</oneSwitch>
            </setSwitchVector>
            <message device="CCD Simulator" message="Driver restarted"/>
            <delProperty device="CCD Simulator" name="CCD_TEMPERATURE"/>
            <delProperty device="CCD Simulator"/>"#,
        )
        .await;

        assert!(matches!(&events[0], TransportEvent::ServerMessage { message, .. } if message == "Port busy"));
        match &events[1] {
            TransportEvent::PropertyUpdated(vector) => {
                assert_eq!(vector.state, Some(PropertyState::Alert));
                assert_eq!(vector.elements[0].value, "Off");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(&events[2], TransportEvent::ServerMessage { message, .. } if message == "Driver restarted"));
        assert_eq!(
            events[3],
            TransportEvent::PropertyRemoved {
                device: "CCD Simulator".to_string(),
                property: Some("CCD_TEMPERATURE".to_string())
            }
        );
        assert_eq!(
            events[4],
            TransportEvent::DeviceRemoved {
                device: "CCD Simulator".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_blob_payload_is_decoded() {
        let payload = BASE64.encode(b"SIMPLE  = T");
        let xml = format!(
            r#"<setBLOBVector device="CCD Simulator" name="CCD1" state="Ok"><oneBLOB name="CCD1" size="11" format=".fits">{}</oneBLOB></setBLOBVector>"#,
            payload
        );
        let events = parse(&xml).await;

        assert_eq!(
            events[0],
            TransportEvent::BlobReceived {
                device: "CCD Simulator".to_string(),
                property: "CCD1".to_string(),
                element: "CCD1".to_string(),
                format: ".fits".to_string(),
                data: b"SIMPLE  = T".to_vec(),
            }
        );
        assert!(matches!(events[1], TransportEvent::PropertyUpdated(_)));
    }

    #[test]
    fn test_request_encoding() {
        let numbers = NewPropertyItem::numbers(
            "Telescope Simulator",
            "EQUATORIAL_EOD_COORD",
            &[("RA", 5.5), ("DEC", -12.25)],
        );
        assert_eq!(
            request_xml(&numbers).unwrap(),
            "<newNumberVector device=\"Telescope Simulator\" name=\"EQUATORIAL_EOD_COORD\">\
             <oneNumber name=\"RA\">5.5</oneNumber><oneNumber name=\"DEC\">-12.25</oneNumber>\
             </newNumberVector>"
        );

        let switch = NewPropertyItem::switch_on("CCD Simulator", "CCD_FRAME_TYPE", "FRAME_DARK");
        assert!(request_xml(&switch)
            .unwrap()
            .contains("<oneSwitch name=\"FRAME_DARK\">On</oneSwitch>"));

        let text = NewPropertyItem::new("CCD Simulator", "UPLOAD_SETTINGS", PropertyType::Text)
            .with_element("UPLOAD_PREFIX", "M31 <light>");
        assert!(request_xml(&text).unwrap().contains("M31 &lt;light&gt;"));
    }
}
