//! SSML generation for prosody-aware synthesis.
//!
//! The mapping from [`AudioDynamics`] to prosody attributes is total and
//! deterministic; the output is validated by re-parsing before it leaves the
//! builder, falling back to the plain no-prosody form if anything is off.

use crate::dynamics::AudioDynamics;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::warn;

/// Allowed `volume` attribute values: exactly the four the loudness classes
/// map to.
const VALID_VOLUMES: [&str; 4] = ["x-soft", "soft", "medium", "x-loud"];
/// Allowed `rate` attribute values.
const VALID_RATES: [&str; 5] = ["x-slow", "slow", "medium", "fast", "x-fast"];

/// Build an SSML document for `text`, applying prosody when dynamics are
/// available.
///
/// Empty text yields an empty string. A document that fails post-build
/// validation is replaced by the no-prosody form.
#[must_use]
pub fn build(text: &str, dynamics: Option<&AudioDynamics>) -> String {
    if text.is_empty() {
        return String::new();
    }

    let Some(dynamics) = dynamics else {
        return plain(text);
    };

    let ssml = format!(
        "<speak><prosody rate=\"{}\" volume=\"{}\">{}</prosody></speak>",
        dynamics.rate.as_ssml(),
        dynamics.volume.as_ssml(),
        escape(text)
    );

    if let Err(reason) = validate(&ssml) {
        warn!("generated SSML failed validation ({reason}), using plain form");
        return plain(text);
    }
    ssml
}

/// The no-prosody form: escaped text wrapped in `<speak>`.
#[must_use]
pub fn plain(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    format!("<speak>{}</speak>", escape(text))
}

/// Escape XML-reserved characters, ampersand first.
#[must_use]
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Recover plain text from an SSML document: strip tags, decode entities,
/// collapse whitespace. Used for the synthesizer's invalid-SSML retry.
#[must_use]
pub fn strip_to_plain_text(ssml: &str) -> String {
    let mut stripped = String::with_capacity(ssml.len());
    let mut in_tag = false;
    for c in ssml.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => stripped.push(c),
            _ => {}
        }
    }

    let decoded = stripped
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");

    let mut out = String::with_capacity(decoded.len());
    let mut first = true;
    for word in decoded.split_whitespace() {
        if !first {
            out.push(' ');
        }
        first = false;
        out.push_str(word);
    }
    out
}

/// Validate an SSML document: parses as XML, root element is `speak`, every
/// `prosody` carries both `rate` and `volume` from the allowed sets.
///
/// # Errors
///
/// Returns a description of the first structural problem found.
pub fn validate(ssml: &str) -> std::result::Result<(), String> {
    let mut reader = Reader::from_str(ssml);
    let mut saw_root = false;
    let mut depth = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if depth == 0 {
                    if name != "speak" {
                        return Err(format!("root element must be speak, got {name}"));
                    }
                    saw_root = true;
                }
                if name == "prosody" {
                    check_prosody_attributes(&e)?;
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if depth == 0 {
                    return Err(format!("root element must be speak, got empty {name}"));
                }
                if name == "prosody" {
                    check_prosody_attributes(&e)?;
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(format!("malformed XML: {e}")),
        }
    }

    if !saw_root {
        return Err("document has no root element".to_owned());
    }
    Ok(())
}

fn check_prosody_attributes(
    element: &quick_xml::events::BytesStart<'_>,
) -> std::result::Result<(), String> {
    let mut rate: Option<String> = None;
    let mut volume: Option<String> = None;

    for attr in element.attributes() {
        let attr = attr.map_err(|e| format!("bad prosody attribute: {e}"))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        match key.as_str() {
            "rate" => rate = Some(value),
            "volume" => volume = Some(value),
            _ => {}
        }
    }

    match rate {
        Some(value) if VALID_RATES.contains(&value.as_str()) => {}
        Some(value) => return Err(format!("invalid prosody rate: {value}")),
        None => return Err("prosody element missing rate attribute".to_owned()),
    }
    match volume {
        Some(value) if VALID_VOLUMES.contains(&value.as_str()) => {}
        Some(value) => return Err(format!("invalid prosody volume: {value}")),
        None => return Err("prosody element missing volume attribute".to_owned()),
    }
    Ok(())
}
