use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::Value;

use crate::error::NormalizeError;

/// Textual timestamp format used in notification files,
/// e.g. `2024-05-17 08:00:00.000000`.
pub const ATM_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// The business attributes uniquely identifying an ATM service location,
/// independent of the generated row id. Components are optional on the
/// wire and carried through as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NaturalKey {
    pub identifier: Option<String>,
    pub street_name: Option<String>,
    pub building_number: Option<String>,
    pub town_name: Option<String>,
    pub district_name: Option<String>,
    pub subdivision_name: Option<String>,
}

/// One normalized ATM service-location record as extracted from a file.
#[derive(Debug, Clone, PartialEq)]
pub struct AtmRecord {
    pub key: NaturalKey,
    pub from_datetime: NaiveDateTime,
    pub to_datetime: NaiveDateTime,
    pub time_type: Option<String>,
    pub attention_hours: Option<String>,
    pub service_type: Option<String>,
    pub access_type: Option<String>,
}

/// Wire shape of one file element. Everything of interest lives under the
/// nested `payload` object; any other keys are ignored.
#[derive(Deserialize, Default)]
struct RawEnvelope {
    #[serde(default)]
    payload: RawPayload,
}

#[derive(Deserialize, Default)]
struct RawPayload {
    atmidentifier: Option<String>,
    atmaddress_streetname: Option<String>,
    atmaddress_buildingnumber: Option<String>,
    atmtownname: Option<String>,
    atmdistrictname: Option<String>,
    atmcountrysubdivisionmajorname: Option<String>,
    atmfromdatetime: Option<String>,
    atmtodatetime: Option<String>,
    atmtimetype: Option<String>,
    atmattentionhour: Option<String>,
    atmservicetype: Option<String>,
    atmaccesstype: Option<String>,
}

/// Parse raw file bytes into ATM records.
///
/// The file may contain either a single JSON object or an array of them; a
/// single object is treated as a one-element sequence. A JSON decode
/// failure skips the whole file. A missing or malformed timestamp is also
/// fatal for the whole file: applying half a file and retrying the rest
/// would make redelivery semantics ambiguous.
pub fn parse_records(raw: &[u8]) -> Result<Vec<AtmRecord>, NormalizeError> {
    let decoded: Value = serde_json::from_slice(raw)?;

    let elements = match decoded {
        Value::Array(items) => items,
        single => vec![single],
    };

    let mut records = Vec::with_capacity(elements.len());
    for element in elements {
        let envelope: RawEnvelope = serde_json::from_value(element)?;
        records.push(normalize(envelope.payload)?);
    }

    Ok(records)
}

fn normalize(payload: RawPayload) -> Result<AtmRecord, NormalizeError> {
    Ok(AtmRecord {
        key: NaturalKey {
            identifier: payload.atmidentifier,
            street_name: payload.atmaddress_streetname,
            building_number: payload.atmaddress_buildingnumber,
            town_name: payload.atmtownname,
            district_name: payload.atmdistrictname,
            subdivision_name: payload.atmcountrysubdivisionmajorname,
        },
        from_datetime: parse_datetime("atmfromdatetime", payload.atmfromdatetime)?,
        to_datetime: parse_datetime("atmtodatetime", payload.atmtodatetime)?,
        time_type: payload.atmtimetype,
        attention_hours: payload.atmattentionhour,
        service_type: payload.atmservicetype,
        access_type: payload.atmaccesstype,
    })
}

fn parse_datetime(
    field: &'static str,
    value: Option<String>,
) -> Result<NaiveDateTime, NormalizeError> {
    let text = value.ok_or(NormalizeError::Validation {
        field,
        detail: "missing".to_owned(),
    })?;

    NaiveDateTime::parse_from_str(&text, ATM_DATETIME_FORMAT).map_err(|e| {
        NormalizeError::Validation {
            field,
            detail: format!("{} ({})", e, text),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> &'static str {
        r#"{
            "payload": {
                "atmidentifier": "ATM0003",
                "atmaddress_streetname": "Av. Vicuña Mackenna Ote",
                "atmaddress_buildingnumber": "6100",
                "atmtownname": "Talca",
                "atmdistrictname": "Las Condes",
                "atmcountrysubdivisionmajorname": "Región de Los Ríos",
                "atmfromdatetime": "2024-05-17 08:00:00.000000",
                "atmtodatetime": "2024-05-17 15:00:00.000000",
                "atmtimetype": "CONT",
                "atmattentionhour": "08:00:00 - 15:00:00",
                "atmservicetype": "DPST",
                "atmaccesstype": "BRAN"
            }
        }"#
    }

    #[test]
    fn parses_a_single_object() {
        let records = parse_records(sample_payload().as_bytes()).unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.key.identifier.as_deref(), Some("ATM0003"));
        assert_eq!(record.key.town_name.as_deref(), Some("Talca"));
        assert_eq!(
            record.from_datetime,
            NaiveDateTime::parse_from_str("2024-05-17 08:00:00.000000", ATM_DATETIME_FORMAT)
                .unwrap()
        );
        assert_eq!(record.service_type.as_deref(), Some("DPST"));
    }

    #[test]
    fn single_object_and_one_element_array_are_equivalent() {
        let single = parse_records(sample_payload().as_bytes()).unwrap();
        let as_array = format!("[{}]", sample_payload());
        let array = parse_records(as_array.as_bytes()).unwrap();

        assert_eq!(single, array);
    }

    #[test]
    fn missing_payload_yields_absent_attributes() {
        // A `payload`-less element is not an error, but its timestamps are
        // then missing, which is.
        let err = parse_records(br#"{"other": 1}"#).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::Validation {
                field: "atmfromdatetime",
                ..
            }
        ));
    }

    #[test]
    fn missing_optional_fields_become_none() {
        let raw = r#"{
            "payload": {
                "atmfromdatetime": "2024-05-17 08:00:00.000000",
                "atmtodatetime": "2024-05-17 15:00:00.000000"
            }
        }"#;
        let records = parse_records(raw.as_bytes()).unwrap();

        assert_eq!(records[0].key.identifier, None);
        assert_eq!(records[0].access_type, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{
            "payload": {
                "atmfromdatetime": "2024-05-17 08:00:00.000000",
                "atmtodatetime": "2024-05-17 15:00:00.000000",
                "atmfuturefield": "whatever"
            },
            "kind": "storage#object"
        }"#;
        assert_eq!(parse_records(raw.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = parse_records(b"not json at all").unwrap_err();
        assert!(matches!(err, NormalizeError::Parse(_)));
    }

    #[test]
    fn malformed_timestamp_is_fatal_for_the_file() {
        let raw = r#"[
            {
                "payload": {
                    "atmfromdatetime": "2024-05-17 08:00:00.000000",
                    "atmtodatetime": "2024-05-17 15:00:00.000000"
                }
            },
            {
                "payload": {
                    "atmfromdatetime": "17/05/2024 08:00",
                    "atmtodatetime": "2024-05-17 15:00:00.000000"
                }
            }
        ]"#;
        let err = parse_records(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, NormalizeError::Validation { .. }));
    }

    #[test]
    fn parses_multiple_records() {
        let raw = format!("[{},{}]", sample_payload(), sample_payload());
        assert_eq!(parse_records(raw.as_bytes()).unwrap().len(), 2);
    }
}
