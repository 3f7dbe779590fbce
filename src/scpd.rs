//! Parsing of a service's SCPD (Service Control Protocol Description) document:
//! the `actionList` and `serviceStateTable` that describe what a service can
//! do. The donor only ever serialized this document (for its device-side
//! services via compile-time `SVariable` markers); a control point has to go
//! the other way and parse whatever SCPD a real device happens to serve.

use anyhow::Context;
use quick_xml::events::Event;

use crate::{
    model::ArgumentDirection,
    service_variables::{DataType, Range},
    templates::SpecVersion,
    FromXml, XmlReaderExt,
};

#[derive(Debug)]
pub struct ScpdXml {
    pub spec_version: SpecVersion,
    pub actions: Vec<ActionXml>,
    pub state_variables: Vec<StateVariableXml>,
}

impl<'a> FromXml<'a> for ScpdXml {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let root = r.read_to_start()?;
        anyhow::ensure!(root.local_name().as_ref() == b"scpd", "expected scpd root");

        let spec_version = SpecVersion::read_xml(r)?;

        let mut actions = Vec::new();
        let mut state_variables = Vec::new();

        loop {
            let event = r.read_event_err_eof()?;
            match event {
                Event::Start(start) => {
                    let start = start.to_owned();
                    match start.local_name().as_ref() {
                        b"actionList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(start.local_name().as_ref() == b"action");
                                        actions.push(ActionXml::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(end.local_name().as_ref() == b"actionList");
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    other => Err(anyhow::anyhow!(
                                        "expected action or list end, got {other:?}"
                                    ))?,
                                }
                            }
                        }
                        b"serviceStateTable" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(
                                            start.local_name().as_ref() == b"stateVariable"
                                        );
                                        let send_events = start
                                            .attributes()
                                            .flatten()
                                            .find(|a| a.key.local_name().as_ref() == b"sendEvents")
                                            .map(|a| a.value.as_ref() == b"yes")
                                            .unwrap_or(false);
                                        state_variables
                                            .push(StateVariableXml::read_xml(r, send_events)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"serviceStateTable"
                                        );
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    other => Err(anyhow::anyhow!(
                                        "expected stateVariable or table end, got {other:?}"
                                    ))?,
                                }
                            }
                        }
                        _ => {
                            r.read_to_end(start.name())?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"scpd");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            spec_version,
            actions,
            state_variables,
        })
    }
}

#[derive(Debug)]
pub struct ActionXml {
    pub name: String,
    pub arguments: Vec<ArgumentXml>,
}

impl<'a> FromXml<'a> for ActionXml {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut name = None;
        let mut arguments = Vec::new();

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"name" => name = Some(r.read_text(end)?.to_string()),
                        b"argumentList" => {
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(
                                            start.local_name().as_ref() == b"argument"
                                        );
                                        arguments.push(ArgumentXml::read_xml(r)?);
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"argumentList"
                                        );
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    other => Err(anyhow::anyhow!(
                                        "expected argument or list end, got {other:?}"
                                    ))?,
                                }
                            }
                        }
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"action");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            name: name.context("action name")?,
            arguments,
        })
    }
}

#[derive(Debug)]
pub struct ArgumentXml {
    pub name: String,
    pub direction: ArgumentDirection,
    pub related_state_variable: String,
}

impl<'a> FromXml<'a> for ArgumentXml {
    fn read_xml(r: &mut quick_xml::Reader<&'a [u8]>) -> anyhow::Result<Self> {
        let mut name = None;
        let mut direction = None;
        let mut related_state_variable = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"name" => name = Some(r.read_text(end)?.to_string()),
                        b"direction" => {
                            direction = Some(r.read_text(end)?.parse::<ArgumentDirection>()?)
                        }
                        b"relatedStateVariable" => {
                            related_state_variable = Some(r.read_text(end)?.to_string())
                        }
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"argument");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            name: name.context("argument name")?,
            direction: direction.context("argument direction")?,
            related_state_variable: related_state_variable.context("relatedStateVariable")?,
        })
    }
}

#[derive(Debug)]
pub struct StateVariableXml {
    pub name: String,
    pub data_type: DataType,
    pub send_events: bool,
    pub allowed_list: Option<Vec<String>>,
    pub range: Option<Range>,
    pub default: Option<String>,
}

impl StateVariableXml {
    fn read_xml<'a>(r: &mut quick_xml::Reader<&'a [u8]>, send_events: bool) -> anyhow::Result<Self> {
        let mut name = None;
        let mut data_type = None;
        let mut allowed_list = None;
        let mut range = None;
        let mut default = None;

        while let Ok(event) = r.read_event() {
            match event {
                Event::Start(start) => {
                    let end = start.name();
                    match start.local_name().as_ref() {
                        b"name" => name = Some(r.read_text(end)?.to_string()),
                        b"dataType" => data_type = Some(r.read_text(end)?.parse::<DataType>()?),
                        b"defaultValue" => default = Some(r.read_text(end)?.to_string()),
                        b"allowedValueList" => {
                            let mut values = Vec::new();
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(start) => {
                                        anyhow::ensure!(
                                            start.local_name().as_ref() == b"allowedValue"
                                        );
                                        values.push(r.read_text(start.name())?.to_string());
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"allowedValueList"
                                        );
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    other => Err(anyhow::anyhow!(
                                        "expected allowedValue or list end, got {other:?}"
                                    ))?,
                                }
                            }
                            allowed_list = Some(values);
                        }
                        b"allowedValueRange" => {
                            let mut start_v = None;
                            let mut end_v = None;
                            let mut step = None;
                            while let Ok(e) = r.read_event() {
                                match e {
                                    Event::Start(s) => {
                                        let end = s.name();
                                        match s.local_name().as_ref() {
                                            b"minimum" => {
                                                start_v = Some(r.read_text(end)?.parse()?)
                                            }
                                            b"maximum" => end_v = Some(r.read_text(end)?.parse()?),
                                            b"step" => step = Some(r.read_text(end)?.parse()?),
                                            _ => {
                                                r.read_to_end(end)?;
                                            }
                                        }
                                    }
                                    Event::End(end) => {
                                        anyhow::ensure!(
                                            end.local_name().as_ref() == b"allowedValueRange"
                                        );
                                        break;
                                    }
                                    Event::Text(_) => {}
                                    other => {
                                        Err(anyhow::anyhow!("unexpected event in range: {other:?}"))?
                                    }
                                }
                            }
                            range = Some(Range {
                                start: start_v.context("allowedValueRange minimum")?,
                                end: end_v.context("allowedValueRange maximum")?,
                                step,
                            });
                        }
                        _ => {
                            r.read_to_end(end)?;
                        }
                    }
                }
                Event::End(end) => {
                    anyhow::ensure!(end.local_name().as_ref() == b"stateVariable");
                    break;
                }
                _ => {}
            }
        }

        Ok(Self {
            name: name.context("stateVariable name")?,
            data_type: data_type.unwrap_or_default(),
            send_events,
            allowed_list,
            range,
            default,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scpd_document() {
        let xml = r#"<?xml version="1.0"?>
<scpd xmlns="urn:schemas-upnp-org:service-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <actionList>
    <action>
      <name>SetVolume</name>
      <argumentList>
        <argument>
          <name>DesiredVolume</name>
          <direction>in</direction>
          <relatedStateVariable>Volume</relatedStateVariable>
        </argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable sendEvents="yes">
      <name>Volume</name>
      <dataType>ui2</dataType>
      <allowedValueRange><minimum>0</minimum><maximum>100</maximum><step>1</step></allowedValueRange>
    </stateVariable>
  </serviceStateTable>
</scpd>"#;
        let mut reader = quick_xml::Reader::from_str(xml);
        let scpd = ScpdXml::read_xml(&mut reader).unwrap();
        assert_eq!(scpd.actions.len(), 1);
        assert_eq!(scpd.actions[0].arguments[0].related_state_variable, "Volume");
        assert_eq!(scpd.state_variables[0].name, "Volume");
        assert!(scpd.state_variables[0].send_events);
        assert_eq!(scpd.state_variables[0].range.unwrap().end, 100);
    }
}
