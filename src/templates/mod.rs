use quick_xml::events::{BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::{FromXml, IntoXml, XmlReaderExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecVersion {
    pub major: usize,
    pub minor: usize,
}

impl SpecVersion {
    /// UPnP2.0 spec version
    pub const fn upnp_v2() -> Self {
        Self { major: 2, minor: 0 }
    }
    pub const fn upnp_v1_1() -> Self {
        Self { major: 1, minor: 1 }
    }
    pub const fn upnp_v1() -> Self {
        Self { major: 1, minor: 0 }
    }
}

impl IntoXml for SpecVersion {
    fn write_xml(&self, w: &mut crate::XmlWriter) -> std::io::Result<()> {
        let parent = BytesStart::new("specVersion");
        w.write_event(Event::Start(parent.clone()))?;
        w.create_element("major")
            .write_text_content(BytesText::new(&self.major.to_string()))?;
        w.create_element("minor")
            .write_text_content(BytesText::new(&self.minor.to_string()))?;
        w.write_event(Event::End(parent.to_end()))
    }
}

impl<'a> FromXml<'a> for SpecVersion {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let start = r.read_to_start()?;
        anyhow::ensure!(start.local_name().as_ref() == b"specVersion");
        let end_name = start.to_end().into_owned();

        let mut major = None;
        let mut minor = None;
        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"major" => major = Some(r.read_text(end)?.parse()?),
                        b"minor" => minor = Some(r.read_text(end)?.parse()?),
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"specVersion");
                    break;
                }
                _ => {}
            }
        }
        let _ = end_name;

        Ok(Self {
            major: major.ok_or_else(|| anyhow::anyhow!("missing specVersion major"))?,
            minor: minor.ok_or_else(|| anyhow::anyhow!("missing specVersion minor"))?,
        })
    }
}
