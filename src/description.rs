//! Parsing of a device's root description document (`device.xml`).
//!
//! Mirrors the shape of the UPnP device description schema closely enough
//! that the `FromXml` implementations below read like a direct transcription
//! of the XML; the [`crate::loader`] module is where these plain records get
//! resolved into the arena-style [`crate::model`] graph.

use anyhow::Context;
use quick_xml::events::Event;

use crate::{templates::SpecVersion, FromXml, XmlReaderExt};

#[derive(Debug)]
pub struct DeviceDescriptionXml {
    pub spec_version: SpecVersion,
    pub device: DeviceXml,
}

impl<'a> FromXml<'a> for DeviceDescriptionXml {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(root.local_name().as_ref() == b"root", "expected root element");
        let root_end = root.to_end().into_owned();

        let spec_version = SpecVersion::read_xml(r)?;

        let device_start = r.read_to_start()?;
        anyhow::ensure!(device_start.local_name().as_ref() == b"device");
        let device = DeviceXml::read_xml(r)?;

        r.read_to_end(root_end.name())?;

        Ok(Self {
            spec_version,
            device,
        })
    }
}

#[derive(Debug)]
pub struct DeviceXml {
    pub device_type: String,
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: Option<String>,
    pub model_description: Option<String>,
    pub model_name: String,
    pub model_number: Option<String>,
    pub model_url: Option<String>,
    pub serial_number: Option<String>,
    pub udn: String,
    pub icon_list: Vec<IconXml>,
    pub service_list: Vec<ServiceXml>,
    pub device_list: Vec<DeviceXml>,
    pub presentation_url: Option<String>,
}

impl<'a> FromXml<'a> for DeviceXml {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut device_type = None;
        let mut friendly_name = None;
        let mut manufacturer = None;
        let mut manufacturer_url = None;
        let mut model_description = None;
        let mut model_name = None;
        let mut model_number = None;
        let mut model_url = None;
        let mut serial_number = None;
        let mut udn = None;
        let mut icon_list = Vec::new();
        let mut service_list = Vec::new();
        let mut device_list = Vec::new();
        let mut presentation_url = None;

        while let Ok(event) = r.read_event_err_eof() {
            match event {
                Event::Start(start) => {
                    let start = start.to_owned();
                    let end_name = start.name();
                    match start.local_name().as_ref() {
                        b"deviceType" => device_type = Some(r.read_text(end_name)?.to_string()),
                        b"friendlyName" => friendly_name = Some(r.read_text(end_name)?.to_string()),
                        b"manufacturer" => manufacturer = Some(r.read_text(end_name)?.to_string()),
                        b"manufacturerURL" => {
                            manufacturer_url = Some(r.read_text(end_name)?.to_string())
                        }
                        b"modelDescription" => {
                            model_description = Some(r.read_text(end_name)?.to_string())
                        }
                        b"modelName" => model_name = Some(r.read_text(end_name)?.to_string()),
                        b"modelNumber" => model_number = Some(r.read_text(end_name)?.to_string()),
                        b"modelURL" => model_url = Some(r.read_text(end_name)?.to_string()),
                        b"serialNumber" => serial_number = Some(r.read_text(end_name)?.to_string()),
                        b"UDN" => udn = Some(r.read_text(end_name)?.to_string()),
                        b"UPC" => {
                            r.read_to_end(end_name)?;
                        }
                        b"iconList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"icon");
                                        icon_list.push(IconXml::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(end.local_name().as_ref() == b"iconList");
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    r => Err(anyhow::anyhow!("expected icon or list end, got {r:?}"))?,
                                }
                            }
                        }
                        b"serviceList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"service");
                                        service_list.push(ServiceXml::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(end.local_name().as_ref() == b"serviceList");
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    r => Err(anyhow::anyhow!(
                                        "expected service or list end, got {r:?}"
                                    ))?,
                                }
                            }
                        }
                        b"deviceList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"device");
                                        device_list.push(DeviceXml::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(end.local_name().as_ref() == b"deviceList");
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    r => {
                                        Err(anyhow::anyhow!("expected device or list end, got {r:?}"))?
                                    }
                                }
                            }
                        }
                        b"presentationURL" => {
                            presentation_url = Some(r.read_text(end_name)?.to_string())
                        }
                        _ => {
                            r.read_to_end(end_name)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(
                        end.local_name().as_ref() == b"device",
                        "expected device end, got {:?}",
                        end
                    );
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            device_type: device_type.context("device type")?,
            friendly_name: friendly_name.context("friendly name")?,
            manufacturer: manufacturer.context("manufacturer")?,
            manufacturer_url,
            model_description,
            model_name: model_name.context("model name")?,
            model_number,
            model_url,
            serial_number,
            udn: udn.context("udn")?,
            icon_list,
            service_list,
            device_list,
            presentation_url,
        })
    }
}

#[derive(Debug)]
pub struct IconXml {
    pub mimetype: String,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub url: String,
}

impl<'a> FromXml<'a> for IconXml {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut mimetype = None;
        let mut width = None;
        let mut height = None;
        let mut depth = None;
        let mut url = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"mimetype" => mimetype = Some(r.read_text(end)?.to_string()),
                        b"width" => width = Some(r.read_text(end)?.parse()?),
                        b"height" => height = Some(r.read_text(end)?.parse()?),
                        b"depth" => depth = Some(r.read_text(end)?.parse()?),
                        b"url" => url = Some(r.read_text(end)?.to_string()),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"icon");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            mimetype: mimetype.context("mimetype")?,
            width: width.context("width")?,
            height: height.context("height")?,
            depth: depth.context("depth")?,
            url: url.context("url")?,
        })
    }
}

#[derive(Debug)]
pub struct ServiceXml {
    pub service_type: String,
    pub service_id: String,
    pub scpd_url: String,
    pub control_url: String,
    pub event_sub_url: String,
}

impl<'a> FromXml<'a> for ServiceXml {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut service_type = None;
        let mut service_id = None;
        let mut scpd_url = None;
        let mut control_url = None;
        let mut event_sub_url = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"serviceType" => service_type = Some(r.read_text(end)?.to_string()),
                        b"serviceId" => service_id = Some(r.read_text(end)?.to_string()),
                        b"SCPDURL" => scpd_url = Some(r.read_text(end)?.to_string()),
                        b"controlURL" => control_url = Some(r.read_text(end)?.to_string()),
                        b"eventSubURL" => event_sub_url = Some(r.read_text(end)?.to_string()),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"service");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            service_type: service_type.context("service type")?,
            service_id: service_id.context("service id")?,
            scpd_url: scpd_url.context("scpd url")?,
            control_url: control_url.context("control url")?,
            event_sub_url: event_sub_url.context("event sub url")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_device_description() {
        let xml = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>
    <friendlyName>Test Server</friendlyName>
    <manufacturer>Acme</manufacturer>
    <modelName>Media Box</modelName>
    <UDN>uuid:01234567-89ab-cdef-0123-456789abcdef</UDN>
    <iconList>
      <icon><mimetype>image/png</mimetype><width>32</width><height>32</height><depth>24</depth><url>/icon.png</url></icon>
    </iconList>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:ContentDirectory:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:ContentDirectory</serviceId>
        <SCPDURL>/cd.xml</SCPDURL>
        <controlURL>/cd/control</controlURL>
        <eventSubURL>/cd/event</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#;
        let mut reader = quick_xml::Reader::from_str(xml);
        let parsed = DeviceDescriptionXml::read_xml(&mut reader).unwrap();
        assert_eq!(parsed.device.friendly_name, "Test Server");
        assert_eq!(parsed.device.icon_list.len(), 1);
        assert_eq!(parsed.device.service_list.len(), 1);
        assert_eq!(
            parsed.device.udn,
            "uuid:01234567-89ab-cdef-0123-456789abcdef"
        );
    }
}
