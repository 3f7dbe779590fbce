//! Async UPnP control point: SSDP discovery of devices on the local network,
//! device/SCPD description loading into an arena-style object graph, GENA
//! event subscriptions, and SOAP action invocation.
//!
//! [`control_point::ControlPoint`] is the entry point applications construct;
//! everything else is a collaborator it wires together.

/// The in-memory object graph a loaded device is resolved into.
pub mod model;
/// Parsing of a device's root description document (`device.xml`).
pub mod description;
/// Parsing of a service's SCPD document (`actionList`/`serviceStateTable`).
pub mod scpd;
/// Public error type and the crate-wide `Result` alias.
pub mod error;
/// The device loader pipeline: description/SCPD download, arena resolution.
pub mod loader;
/// SOAP action invocation against a service's control URL.
pub mod soap;
/// GENA subscription management (SUBSCRIBE/RENEW/UNSUBSCRIBE).
pub mod subscription;
/// The GENA NOTIFY event receiver, unicast and multicast.
pub mod event_receiver;
/// The authoritative in-memory device registry.
pub mod registry;
/// The [`control_point::ControlPoint`] facade.
pub mod control_point;
/// Simple Service Discovery Protocol ([SSDP](https://en.wikipedia.org/wiki/Simple_Service_Discovery_Protocol)) implementation.
pub mod ssdp;
pub mod templates;
pub mod urn;
mod service_variables;

/// Useful utility functions for [Reader](quick_xml::Reader)
pub trait XmlReaderExt<'a> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>>;
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>>;
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)>;
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>>;
    fn read_text(&mut self) -> anyhow::Result<quick_xml::events::BytesText<'a>>;
}

impl<'a> XmlReaderExt<'a> for quick_xml::Reader<&'a [u8]> {
    fn read_event_err_eof(&mut self) -> anyhow::Result<quick_xml::events::Event<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Eof => Err(anyhow::anyhow!("early eof")),
            _ => Ok(event),
        }
    }
    fn read_to_start(&mut self) -> anyhow::Result<quick_xml::events::BytesStart<'a>> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            if let quick_xml::events::Event::Start(e) = event {
                break Ok(e);
            }
        }
    }
    fn read_to_start_or_empty(
        &mut self,
    ) -> anyhow::Result<(bool, quick_xml::events::BytesStart<'a>)> {
        loop {
            let event = self.read_event_err_eof()?.into_owned();
            match event {
                quick_xml::events::Event::Start(e) => break Ok((false, e)),
                quick_xml::events::Event::Empty(e) => break Ok((true, e)),
                _ => (),
            }
        }
    }
    fn read_end(&mut self) -> anyhow::Result<quick_xml::events::BytesEnd<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::End(e) => Ok(e),
            e => anyhow::bail!("expected end, got {:?}", e),
        }
    }
    fn read_text(&mut self) -> anyhow::Result<quick_xml::events::BytesText<'a>> {
        let event = self.read_event()?;
        match event {
            quick_xml::events::Event::Text(e) => Ok(e),
            e => anyhow::bail!("expected text, got {:?}", e),
        }
    }
}

pub type XmlWriter = quick_xml::Writer<Vec<u8>>;

/// Allows structs to serialize themselves into xml fragments
pub trait IntoXml {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()>;

    fn into_string(&self) -> std::io::Result<String> {
        let mut w = quick_xml::Writer::new(Vec::new());
        self.write_xml(&mut w)?;
        Ok(String::from_utf8(w.into_inner()).expect("produced value to be utf-8"))
    }
}

impl std::fmt::Debug for Box<dyn IntoXml> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_string().unwrap())
    }
}

/// Allows structs to deserialize themselves from xml reader
pub trait FromXml<'a> {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self>
    where
        Self: Sized;
}

impl<T: IntoXml> IntoXml for Vec<T> {
    fn write_xml(&self, w: &mut XmlWriter) -> std::io::Result<()> {
        for el in self {
            el.write_xml(w)?;
        }
        Ok(())
    }
}
