//! SOAP action invocation: building the request envelope, POSTing it to a
//! service's control URL and parsing whatever comes back.
//!
//! The donor builds these envelopes from compile-time-typed `SVariable`
//! markers (one Rust type per state variable). A control point only knows
//! argument names and string values learned from SCPD at runtime, so the
//! envelope here is built and read as a plain list of names and strings
//! instead.

use std::str::FromStr;

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::{error::Error, urn::URN, FromXml, XmlReaderExt};

/// Builds a `<s:Envelope><s:Body><u:ActionName>...` request the same way the
/// donor's `WritableAction` does, except arguments are plain strings.
pub struct WritableAction {
    w: quick_xml::Writer<Vec<u8>>,
    action_name: String,
}

impl WritableAction {
    pub fn new(action_name: &str, urn: &URN) -> anyhow::Result<Self> {
        let mut w = quick_xml::Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let envelope = BytesStart::new("s:Envelope").with_attributes([
            ("xmlns:s", "http://schemas.xmlsoap.org/soap/envelope/"),
            (
                "s:encodingStyle",
                "http://schemas.xmlsoap.org/soap/encoding/",
            ),
        ]);
        w.write_event(Event::Start(envelope))?;
        let body = BytesStart::new("s:Body");
        w.write_event(Event::Start(body))?;

        let action_tag = format!("u:{action_name}");
        let urn = urn.to_string();
        let action = BytesStart::new(&action_tag).with_attributes([("xmlns:u", urn.as_str())]);
        w.write_event(Event::Start(action))?;

        Ok(Self {
            w,
            action_name: action_tag,
        })
    }

    pub fn write_argument(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        self.w.create_element(name).write_text_content(
            quick_xml::events::BytesText::new(value),
        )?;
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<String> {
        self.w
            .write_event(Event::End(BytesEnd::new(self.action_name.clone())))?;
        self.w.write_event(Event::End(BytesEnd::new("s:Body")))?;
        self.w
            .write_event(Event::End(BytesEnd::new("s:Envelope")))?;
        Ok(String::from_utf8(self.w.into_inner())?)
    }
}

/// Builds the outgoing envelope for invoking `action_name` on `urn` with
/// `arguments` given in SCPD order.
pub fn build_request(
    action_name: &str,
    urn: &URN,
    arguments: &[(String, String)],
) -> anyhow::Result<String> {
    let mut w = WritableAction::new(action_name, urn)?;
    for (name, value) in arguments {
        w.write_argument(name, value)?;
    }
    w.finish()
}

/// A successfully parsed action response: its name (without the `Response`
/// suffix) and its out arguments in document order.
#[derive(Debug)]
pub struct ActionResponse {
    pub action_name: String,
    pub service_urn: URN,
    pub arguments: Vec<(String, String)>,
}

impl ActionResponse {
    fn read_xml<'a, 'b>(
        r: &mut quick_xml::Reader<&'a [u8]>,
        urn: URN,
        action_tag_name: quick_xml::name::QName<'b>,
    ) -> anyhow::Result<Self> {
        let mut arguments = Vec::new();

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let name = String::from_utf8(start.local_name().as_ref().to_vec())?;
                    let value = r.read_text(start.name())?.to_string();
                    arguments.push((name, value));
                }
                Event::End(end) if end.name() == action_tag_name => break,
                Event::Text(_) => {}
                other => anyhow::bail!("expected action end, got {:?}", other),
            }
        }

        let action_name = std::str::from_utf8(action_tag_name.into_inner())
            .context("convert action tag name to string")?;
        let action_name = action_name
            .strip_suffix("Response")
            .context("strip Response suffix")?
            .to_owned();

        Ok(Self {
            action_name,
            service_urn: urn,
            arguments,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ActionErrorCode {
    /// No action by that name at this service.
    InvalidAction,
    /// Not enough in args, args in the wrong order, or wrong data type.
    InvalidArguments,
    /// Current state of service prevents invoking that action.
    ActionFailed,
    ArgumentInvalid,
    ArgumentValueOutOfRange,
    OptionalActionNotImplemented,
    OutOfMemory,
    HumanInterventionRequired,
    StringArgumentTooLong,
    Other(u16),
}

impl ActionErrorCode {
    pub fn code(&self) -> u16 {
        match self {
            ActionErrorCode::InvalidAction => 401,
            ActionErrorCode::InvalidArguments => 402,
            ActionErrorCode::ActionFailed => 501,
            ActionErrorCode::ArgumentInvalid => 600,
            ActionErrorCode::ArgumentValueOutOfRange => 601,
            ActionErrorCode::OptionalActionNotImplemented => 602,
            ActionErrorCode::OutOfMemory => 603,
            ActionErrorCode::HumanInterventionRequired => 604,
            ActionErrorCode::StringArgumentTooLong => 605,
            ActionErrorCode::Other(code) => *code,
        }
    }
}

impl From<u16> for ActionErrorCode {
    fn from(value: u16) -> Self {
        match value {
            401 => ActionErrorCode::InvalidAction,
            402 => ActionErrorCode::InvalidArguments,
            501 => ActionErrorCode::ActionFailed,
            600 => ActionErrorCode::ArgumentInvalid,
            601 => ActionErrorCode::ArgumentValueOutOfRange,
            602 => ActionErrorCode::OptionalActionNotImplemented,
            603 => ActionErrorCode::OutOfMemory,
            604 => ActionErrorCode::HumanInterventionRequired,
            605 => ActionErrorCode::StringArgumentTooLong,
            other => ActionErrorCode::Other(other),
        }
    }
}

#[derive(Debug)]
pub struct ActionError {
    pub code: ActionErrorCode,
    pub description: Option<String>,
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(description) = &self.description {
            write!(f, "{}: {}", self.code.code(), description)
        } else {
            write!(f, "{}", self.code.code())
        }
    }
}
impl std::error::Error for ActionError {}

impl ActionError {
    fn read_xml<'a, 'b>(
        r: &mut quick_xml::Reader<&'a [u8]>,
        end_tag: quick_xml::name::QName<'b>,
    ) -> anyhow::Result<Self> {
        let fault_code = r.read_to_start()?;
        anyhow::ensure!(fault_code.local_name().as_ref() == b"faultcode");
        r.read_to_end(fault_code.name())?;
        let fault_string = r.read_to_start()?;
        anyhow::ensure!(fault_string.local_name().as_ref() == b"faultstring");
        let fault_string_text = r.read_text(fault_string.name())?;
        anyhow::ensure!(fault_string_text == "UPnPError");
        let detail = r.read_to_start()?;
        anyhow::ensure!(detail.local_name().as_ref() == b"detail");
        let upnp_error = r.read_to_start()?;
        anyhow::ensure!(upnp_error.local_name().as_ref() == b"UPnPError");
        let error_code = r.read_to_start()?;
        anyhow::ensure!(error_code.local_name().as_ref() == b"errorCode");
        let code = r.read_text(error_code.name())?;
        let code: u16 = code.parse().context("parse error code")?;
        let mut description = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    anyhow::ensure!(start.local_name().as_ref() == b"errorDescription");
                    description = Some(r.read_text(start.name())?.to_string());
                    r.read_to_end(upnp_error.name())?;
                    break;
                }
                Event::End(end) => {
                    anyhow::ensure!(end == upnp_error.to_end());
                    break;
                }
                Event::Text(_) => {}
                other => anyhow::bail!("expected description or fault end, got {:?}", other),
            }
        }

        r.read_to_end(detail.name())?;
        r.read_to_end(end_tag)?;

        Ok(Self {
            code: code.into(),
            description,
        })
    }
}

fn parse_response(
    raw_xml: &str,
) -> anyhow::Result<std::result::Result<ActionResponse, ActionError>> {
    let mut r = quick_xml::Reader::from_str(raw_xml);
    let envelope = r.read_to_start()?.into_owned();
    anyhow::ensure!(envelope.local_name().as_ref() == b"Envelope");
    let body = r.read_to_start()?.into_owned();
    anyhow::ensure!(body.local_name().as_ref() == b"Body");

    let start = r.read_to_start()?;
    let result = match start.local_name().as_ref() {
        b"Fault" => Err(ActionError::read_xml(&mut r, start.name())?),
        other if other.ends_with(b"Response") => {
            let urn = start
                .attributes()
                .flatten()
                .filter_map(|attr| attr.unescape_value().ok())
                .find_map(|attr| attr.starts_with("urn").then(|| URN::from_str(&attr)));
            let urn = urn.context("urn attribute is not found")??;
            Ok(ActionResponse::read_xml(&mut r, urn, start.name())?)
        }
        other => anyhow::bail!("expected fault or response, got {:?}", other),
    };

    r.read_to_end(body.name())?;
    r.read_to_end(envelope.name())?;
    Ok(result)
}

/// POSTs a built SOAP request to `control_url` with the `SOAPACTION` header
/// the spec requires, and parses the response into either an
/// [`ActionResponse`] or the device's reported [`ActionError`].
pub async fn invoke(
    client: &reqwest::Client,
    control_url: &str,
    urn: &URN,
    action_name: &str,
    arguments: &[(String, String)],
) -> crate::error::Result<std::result::Result<ActionResponse, ActionError>> {
    let body = build_request(action_name, urn, arguments).map_err(Error::from)?;
    let soap_action = format!("\"{urn}#{action_name}\"");

    let response = client
        .post(control_url)
        .header("Content-Type", "text/xml; charset=\"utf-8\"")
        .header("SOAPACTION", soap_action)
        .body(body)
        .send()
        .await?;
    let text = response.text().await?;
    parse_response(&text).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::urn::{ServiceType, UrnType};

    fn urn() -> URN {
        URN {
            version: 1,
            urn_type: UrnType::Service(ServiceType::Other("Volume".to_string())),
        }
    }

    #[test]
    fn builds_request_envelope() {
        let request = build_request(
            "SetVolume",
            &urn(),
            &[("DesiredVolume".to_string(), "10".to_string())],
        )
        .unwrap();
        assert!(request.contains("<u:SetVolume"));
        assert!(request.contains("<DesiredVolume>10</DesiredVolume>"));
    }

    #[test]
    fn parses_successful_response() {
        let xml = format!(
            r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<u:SetVolumeResponse xmlns:u="{urn}">
<CurrentVolume>10</CurrentVolume>
</u:SetVolumeResponse>
</s:Body>
</s:Envelope>"#,
            urn = urn()
        );
        let parsed = parse_response(&xml).unwrap().unwrap();
        assert_eq!(parsed.action_name, "SetVolume");
        assert_eq!(
            parsed.arguments,
            vec![("CurrentVolume".to_string(), "10".to_string())]
        );
    }

    #[test]
    fn parses_fault_response() {
        let xml = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body>
<s:Fault>
<faultcode>s:Client</faultcode>
<faultstring>UPnPError</faultstring>
<detail>
<UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
<errorCode>401</errorCode>
</UPnPError>
</detail>
</s:Fault>
</s:Body>
</s:Envelope>"#;
        let parsed = parse_response(xml).unwrap().unwrap_err();
        assert_eq!(parsed.code.code(), 401);
    }
}
