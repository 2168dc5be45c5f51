//! Plaintext report formatting for submitted records.

use crate::gis::{Feature, Point};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::fmt::Write as _;

/// Subject of the message sent back to the submitter.
pub const THANK_YOU_SUBJECT: &str = "Thank you for reporting a banded Sandhill Crane!";

/// Typed view of one submitted record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub object_id: Option<i64>,
    pub observed_on: Option<NaiveDate>,
    pub submitted_on: Option<NaiveDate>,
    pub time: String,
    pub count: String,
    pub county: Option<String>,
    pub state: String,
    pub observer: String,
    pub email: String,
    pub phone: String,
    pub details: String,
    pub location_description: String,
    pub bands: String,
    pub location: Option<Point>,
}

impl Report {
    /// Build a report from a feature's attributes. Attribute names are
    /// matched exactly first, then case-insensitively.
    #[must_use]
    pub fn from_feature(feature: &Feature, object_id_field: &str) -> Self {
        let attrs = Attributes(&feature.attributes);
        Self {
            object_id: attrs
                .get(object_id_field)
                .or_else(|| attrs.get("objectid"))
                .and_then(value_as_i64),
            observed_on: attrs.get("date").and_then(value_as_i64).and_then(epoch_millis_to_date),
            submitted_on: attrs
                .get("CreationDate")
                .and_then(value_as_i64)
                .and_then(epoch_millis_to_date),
            time: attrs.text("time"),
            count: attrs.text("numsacr"),
            county: Some(attrs.text("county")).filter(|c| !c.is_empty()),
            state: attrs.text("state"),
            observer: attrs.text("name"),
            email: attrs.text("email"),
            phone: attrs.text("phone"),
            details: attrs.text("details"),
            location_description: attrs.text("locationdesc"),
            bands: attrs.text("bands"),
            location: feature.geometry,
        }
    }

    /// `"{county} County, {state}"`, or just the state without a county.
    #[must_use]
    pub fn place(&self) -> String {
        match &self.county {
            Some(county) => format!("{county} County, {}", self.state),
            None => self.state.clone(),
        }
    }

    /// `"lat, lon"` of the record's location.
    #[must_use]
    pub fn lat_lon(&self) -> String {
        self.location
            .map(|p| format!("{}, {}", p.y, p.x))
            .unwrap_or_default()
    }

    /// Satellite map link centred on the record's location.
    #[must_use]
    pub fn map_link(&self) -> String {
        self.location
            .map(|p| {
                format!(
                    "https://www.google.com/maps/place/{y},{x}/@{y},{x},17z/data=!3m1!1e3",
                    x = p.x,
                    y = p.y
                )
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn subject(&self) -> String {
        format!(
            "SACR Report - {} {} {}",
            format_date(self.observed_on),
            self.time,
            self.place()
        )
    }

    /// Body of the message sent to stakeholders.
    #[must_use]
    pub fn stakeholder_body(&self) -> String {
        let mut msg = String::new();
        let _ = writeln!(
            msg,
            "A new Sandhill Crane Sighting was submitted on {}.\n",
            format_date(self.submitted_on)
        );
        self.write_observation(&mut msg);
        let _ = writeln!(msg, "Latitude, Longitude:    {}", self.lat_lon());
        msg.push_str(
            "NOTE: Submitter may not have moved the map to locate the actual observation location.\n\
             The location may not be accurate.\n",
        );
        let _ = writeln!(msg, "{}\n", self.map_link());
        self.write_contact_and_notes(&mut msg);
        msg
    }

    /// Body of the thank-you message sent to the submitter.
    #[must_use]
    pub fn thank_you_body(&self) -> String {
        let mut msg = String::new();
        msg.push_str("Thank you for reporting your banded Sandhill crane sighting.\n");
        msg.push_str("Our researchers will contact you if we have questions.\n\n");
        msg.push_str("Here is the report we received.\n");
        msg.push_str("-------------------------------\n");
        self.write_observation(&mut msg);
        msg.push('\n');
        self.write_contact_and_notes(&mut msg);
        msg
    }

    fn write_observation(&self, msg: &mut String) {
        let _ = writeln!(msg, "Observation Date:       {}", format_date(self.observed_on));
        let _ = writeln!(msg, "Observation Time:       {}", self.time);
        let _ = writeln!(msg, "Number of SACR:         {}", self.count);
        let _ = writeln!(msg, "County, State:          {}", self.place());
    }

    fn write_contact_and_notes(&self, msg: &mut String) {
        let _ = writeln!(msg, "Observer:               {}", self.observer);
        let _ = writeln!(msg, "Email:                  {}", self.email);
        let _ = writeln!(msg, "Phone #                 {}\n", self.phone);
        let _ = writeln!(msg, "Description:\n{}\n", self.details);
        let _ = writeln!(msg, "Location Description:\n{}\n", self.location_description);
        let _ = write!(msg, "Bands:\n{}", self.bands);
    }
}

/// Who receives the stakeholder report.
#[derive(Debug, Clone)]
pub struct Routing {
    pub default_recipient: String,
    /// Recipient for records whose state is in `regions`.
    pub regional_recipient: Option<String>,
    pub regions: Vec<String>,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            default_recipient: String::new(),
            regional_recipient: None,
            regions: ["CA", "WA", "OR", "BC", "AK"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Routing {
    #[must_use]
    pub fn recipient_for(&self, report: &Report) -> &str {
        match &self.regional_recipient {
            Some(regional)
                if self
                    .regions
                    .iter()
                    .any(|r| r.eq_ignore_ascii_case(report.state.trim())) =>
            {
                regional
            }
            _ => &self.default_recipient,
        }
    }
}

/// Epoch milliseconds to a UTC calendar date. Values before 1970 are negative.
#[must_use]
pub fn epoch_millis_to_date(millis: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.date_naive())
}

fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

struct Attributes<'a>(&'a serde_json::Map<String, Value>);

impl<'a> Attributes<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.0
            .get(name)
            .or_else(|| {
                self.0
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .filter(|v| !v.is_null())
    }

    fn text(&self, name: &str) -> String {
        match self.get(name) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
