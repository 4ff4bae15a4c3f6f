//! Pull keys and neighbor scans out of decrypted inform documents.
//!
//! Decoding is two steps: the escaped newlines that devices embed inside
//! string fields are flattened to commas, then the bytes are parsed into a
//! schema where every field is optional and unknown fields are ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::ExtractError;
use crate::geo::{AccessPoint, Geolocator, Location};
use crate::output::{Event, Reporter};
use crate::registry::{KeyRegistry, LocatedDevices};

const SETPARAM: &str = "setparam";
const AUTHKEY: &str = "authkey";

/// Replace every literal backslash-`n` pair with `,`.
pub fn substitute_newlines(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' && raw.get(i + 1) == Some(&b'n') {
            out.push(b',');
            i += 2;
        } else {
            out.push(raw[i]);
            i += 1;
        }
    }
    out
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct InformDocument {
    #[serde(rename = "_type", deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub mgmt_cfg: Option<String>,
    #[serde(deserialize_with = "lenient_seq")]
    pub radio_table: Option<Vec<Radio>>,
    #[serde(deserialize_with = "lenient")]
    pub serial: Option<String>,
}

impl InformDocument {
    pub fn parse(raw: &[u8]) -> Result<Self, ExtractError> {
        Ok(serde_json::from_slice(&substitute_newlines(raw))?)
    }

    /// The management config of a `setparam` document.
    pub fn config(&self) -> Option<ConfigFact> {
        let kind = self.kind.as_deref().filter(|k| *k == SETPARAM)?;
        Some(parse_config(kind, self.mgmt_cfg.as_deref()?))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Radio {
    #[serde(deserialize_with = "lenient_seq")]
    pub scan_table: Option<Vec<Neighbor>>,
}

/// One entry of a radio's neighbor scan.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct Neighbor {
    #[serde(deserialize_with = "lenient")]
    pub band: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub bssid: Option<String>,
    #[serde(rename = "bw", deserialize_with = "lenient_int")]
    pub bandwidth: Option<i64>,
    #[serde(deserialize_with = "lenient_int")]
    pub channel: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    pub essid: Option<String>,
    #[serde(deserialize_with = "lenient_int")]
    pub noise: Option<i64>,
    #[serde(deserialize_with = "lenient_int")]
    pub signal: Option<i64>,
    #[serde(deserialize_with = "lenient_int")]
    pub age: Option<i64>,
}

/// A field of the wrong type reads as absent instead of failing the document.
fn lenient<'de, D, T>(d: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(serde_json::from_value(Value::deserialize(d)?).ok())
}

/// Like `lenient`, but keeps the well-formed elements of an array.
fn lenient_seq<'de, D, T>(d: D) -> Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Value::deserialize(d)? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
        ),
        _ => None,
    })
}

/// Accept numbers, numeric strings and null; anything else reads as absent.
fn lenient_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// A management config string and its `name=value` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFact {
    pub kind: String,
    pub raw: String,
    pub pairs: Vec<(String, String)>,
}

/// Split `raw` on `,` then each chunk on its first `=`. Chunks without `=` are dropped.
pub fn parse_config(kind: &str, raw: &str) -> ConfigFact {
    let pairs = raw
        .split(',')
        .filter_map(|chunk| chunk.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ConfigFact {
        kind: kind.to_string(),
        raw: raw.to_string(),
        pairs,
    }
}

impl ConfigFact {
    /// Value of the first `authkey` pair.
    pub fn authkey(&self) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(name, _)| name == AUTHKEY)
            .map(|(_, value)| value.as_str())
    }
}

/// All radios' scan entries, radio order first.
pub fn flatten_neighbors(radios: &[Radio]) -> Vec<&Neighbor> {
    radios.iter().flat_map(|r| r.scan_table.iter().flatten()).collect()
}

/// Entries with a zero (or missing) signal are not usable for location.
pub fn access_points(neighbors: &[&Neighbor]) -> Vec<AccessPoint> {
    neighbors
        .iter()
        .filter_map(|n| {
            let signal = n.signal.filter(|&s| s != 0)?;
            let noise = n.noise.unwrap_or(0);
            Some(AccessPoint {
                mac_address: n.bssid.clone().unwrap_or_default(),
                signal_strength: signal as f64,
                channel: n.channel.unwrap_or(0),
                signal_to_noise_ratio: signal as f64 - noise as f64,
            })
        })
        .collect()
}

/// What one document yielded.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Harvest {
    pub authkey: Option<String>,
    /// The authkey was not in the registry before.
    pub new_key: bool,
    pub location: Option<Location>,
}

pub struct Extractor {
    keys: Arc<KeyRegistry>,
    located: Arc<LocatedDevices>,
    geolocator: Option<Arc<dyn Geolocator>>,
    reporter: Arc<dyn Reporter>,
}

impl Extractor {
    pub fn new(
        keys: Arc<KeyRegistry>,
        located: Arc<LocatedDevices>,
        geolocator: Option<Arc<dyn Geolocator>>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Extractor {
            keys,
            located,
            geolocator,
            reporter,
        }
    }

    /// Harvest facts from a decrypted payload, attributing them to `peer`.
    pub fn extract(&self, payload: &[u8], peer: SocketAddr) -> Result<Harvest, ExtractError> {
        let doc = InformDocument::parse(payload)?;
        let mut harvest = Harvest::default();

        if let Some(key) = doc.config().as_ref().and_then(ConfigFact::authkey) {
            harvest.new_key = self.keys.add_key(key);
            harvest.authkey = Some(key.to_string());
            info!(%peer, key, new = harvest.new_key, "discovered key");
            self.reporter.report(&Event::KeyDiscovered {
                peer,
                key: key.to_string(),
            });
        }

        if let Some(geolocator) = &self.geolocator {
            harvest.location = self.locate(geolocator.as_ref(), &doc, peer);
        }
        Ok(harvest)
    }

    fn locate(&self, geolocator: &dyn Geolocator, doc: &InformDocument, peer: SocketAddr) -> Option<Location> {
        let radios = doc.radio_table.as_deref().filter(|r| !r.is_empty())?;
        let serial = doc.serial.as_deref().filter(|s| !s.is_empty())?;
        if !self.located.insert(serial) {
            return None;
        }

        let aps = access_points(&flatten_neighbors(radios));
        if aps.is_empty() {
            debug!(serial, "no usable neighbors to geolocate with");
            return None;
        }

        match geolocator.geolocate(serial, &aps) {
            Ok(location) => {
                info!(
                    serial,
                    %peer,
                    lat = location.lat,
                    lng = location.lng,
                    accuracy = location.accuracy,
                    "device located"
                );
                self.reporter.report(&Event::DeviceLocated {
                    peer,
                    serial: serial.to_string(),
                    location,
                });
                Some(location)
            }
            Err(e) if e.is_skip() => {
                info!(serial, "not geolocating because no API key");
                None
            }
            Err(e) => {
                error!(serial, error = %e, "geolocation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GeoError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Events(Mutex<Vec<Event>>);

    impl Reporter for Events {
        fn report(&self, event: &Event) {
            self.0.lock().push(event.clone());
        }
    }

    #[derive(Default)]
    struct FakeGeo {
        calls: Mutex<Vec<(String, Vec<AccessPoint>)>>,
        no_key: bool,
    }

    impl Geolocator for FakeGeo {
        fn geolocate(&self, serial: &str, aps: &[AccessPoint]) -> Result<Location, GeoError> {
            self.calls.lock().push((serial.to_string(), aps.to_vec()));
            if self.no_key {
                return Err(GeoError::NoCredential);
            }
            Ok(Location {
                lat: 10.0,
                lng: 20.0,
                accuracy: 30.0,
            })
        }
    }

    struct Fixture {
        keys: Arc<KeyRegistry>,
        located: Arc<LocatedDevices>,
        geo: Arc<FakeGeo>,
        events: Arc<Events>,
        extractor: Extractor,
    }

    fn fixture(geo: FakeGeo) -> Fixture {
        let keys = Arc::new(KeyRegistry::new());
        let located = Arc::new(LocatedDevices::new());
        let geo = Arc::new(geo);
        let events = Arc::new(Events::default());
        let extractor = Extractor::new(
            keys.clone(),
            located.clone(),
            Some(geo.clone() as Arc<dyn Geolocator>),
            events.clone(),
        );
        Fixture {
            keys,
            located,
            geo,
            events,
            extractor,
        }
    }

    fn peer() -> SocketAddr {
        "192.168.1.20:51000".parse().unwrap()
    }

    const SCAN_DOC: &str = r#"{
        "serial": "F09FC2000001",
        "radio_table": [
            {"name": "wifi0", "scan_table": [
                {"bssid": "aa:aa:aa:aa:aa:01", "signal": -40, "noise": -95, "channel": 6, "bw": 20, "essid": "a", "band": "ng", "age": 3},
                {"bssid": "aa:aa:aa:aa:aa:02", "signal": 0, "noise": -95, "channel": 1}
            ]},
            {"name": "wifi1", "scan_table": [
                {"bssid": "bb:bb:bb:bb:bb:01", "signal": -70, "noise": -90, "channel": 36},
                {"bssid": "bb:bb:bb:bb:bb:02", "signal": "-60", "noise": "-92", "channel": "44"},
                {"bssid": "bb:bb:bb:bb:bb:03", "signal": -80, "noise": -91, "channel": 149}
            ]}
        ]
    }"#;

    #[test]
    fn substitution_replaces_escaped_newlines_only() {
        assert_eq!(substitute_newlines(br"a\nb\nc"), b"a,b,c");
        assert_eq!(substitute_newlines(b"real\nnewline"), b"real\nnewline");
        assert_eq!(substitute_newlines(br"trailing\"), br"trailing\");
        assert_eq!(substitute_newlines(br"\\n"), br"\,");
    }

    #[test]
    fn substituted_field_has_one_segment_per_line() {
        let raw = br#"{"_type":"setparam","mgmt_cfg":"capability=notif\nselfrun_guest=pass\ncfgversion=abc\nauthkey=k1"}"#;
        assert!(serde_json::from_slice::<InformDocument>(raw).is_ok());
        let doc = InformDocument::parse(raw).unwrap();
        let cfg = doc.mgmt_cfg.unwrap();
        assert!(!cfg.contains('\n'));
        assert_eq!(cfg.split(',').count(), 4);
    }

    #[test]
    fn unknown_and_missing_fields_tolerated() {
        let doc = InformDocument::parse(br#"{"uptime": 12, "extra": {"x": [1,2]}}"#).unwrap();
        assert!(doc.kind.is_none());
        assert!(doc.radio_table.is_none());
    }

    #[test]
    fn non_json_payload_is_structure_error() {
        assert!(matches!(
            InformDocument::parse(b"\x00\x01garbage"),
            Err(ExtractError::Structure(_))
        ));
    }

    #[test]
    fn parse_config_pairs() {
        let fact = parse_config(SETPARAM, "a=1,junk,b=x=y,c=");
        assert_eq!(fact.kind, "setparam");
        assert_eq!(fact.raw, "a=1,junk,b=x=y,c=");
        assert_eq!(
            fact.pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x=y".to_string()),
                ("c".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn authkey_is_first_matching_pair() {
        let authkey = |raw: &str| parse_config(SETPARAM, raw).authkey().map(str::to_string);
        assert_eq!(authkey("x=1,authkey=first,authkey=second").as_deref(), Some("first"));
        assert_eq!(authkey("authkey,other=1"), None);
        assert_eq!(authkey(""), None);
    }

    #[test]
    fn config_only_for_setparam() {
        let doc = InformDocument::parse(br#"{"_type":"setparam","mgmt_cfg":"a=1\nauthkey=k"}"#).unwrap();
        let fact = doc.config().unwrap();
        assert_eq!(fact.kind, "setparam");
        assert_eq!(fact.authkey(), Some("k"));
        let doc = InformDocument::parse(br#"{"_type":"noop","mgmt_cfg":"authkey=k"}"#).unwrap();
        assert!(doc.config().is_none());
    }

    #[test]
    fn wrongly_typed_field_does_not_hide_the_key() {
        let f = fixture(FakeGeo::default());
        let doc = br#"{"_type":"setparam","mgmt_cfg":"authkey=abc,other=1","serial":12345}"#;
        let h = f.extractor.extract(doc, peer()).unwrap();
        assert_eq!(h.authkey.as_deref(), Some("abc"));
        assert_eq!(f.keys.keys(), vec!["abc".to_string()]);
    }

    #[test]
    fn bad_scan_entries_skipped_not_fatal() {
        let doc = InformDocument::parse(
            br#"{"radio_table":[7,{"scan_table":"none"},{"scan_table":[null,{"bssid":5,"signal":-50}]}]}"#,
        )
        .unwrap();
        let radios = doc.radio_table.unwrap();
        assert_eq!(radios.len(), 2);
        let flat = flatten_neighbors(&radios);
        assert_eq!(flat.len(), 1);
        assert_eq!(flat[0].bssid, None);
        assert_eq!(flat[0].signal, Some(-50));
    }

    #[test]
    fn extreme_signal_values_do_not_overflow() {
        let f = fixture(FakeGeo::default());
        let doc = br#"{"serial":"S","radio_table":[{"scan_table":[
            {"bssid":"x","signal":"9223372036854775807","noise":-1},
            {"bssid":"y","signal":-9223372036854775808,"noise":9223372036854775807}
        ]}]}"#;
        let h = f.extractor.extract(doc, peer()).unwrap();
        assert!(h.location.is_some());
        let calls = f.geo.calls.lock();
        let aps = &calls[0].1;
        assert_eq!(aps.len(), 2);
        assert!(aps[0].signal_to_noise_ratio > 9.2e18);
        assert!(aps[1].signal_to_noise_ratio < -1.8e19);
    }

    #[test]
    fn setparam_registers_key_once() {
        let f = fixture(FakeGeo::default());
        let doc = br#"{"_type":"setparam","mgmt_cfg":"authkey=abc,other=1"}"#;
        let h = f.extractor.extract(doc, peer()).unwrap();
        assert_eq!(h.authkey.as_deref(), Some("abc"));
        assert!(h.new_key);

        let h = f.extractor.extract(doc, peer()).unwrap();
        assert!(!h.new_key);
        assert_eq!(f.keys.keys(), vec!["abc".to_string()]);

        let events = f.events.0.lock();
        assert!(matches!(&events[0], Event::KeyDiscovered { key, peer: p } if key == "abc" && *p == peer()));
    }

    #[test]
    fn authkey_ignored_for_other_types() {
        let f = fixture(FakeGeo::default());
        f.extractor
            .extract(br#"{"_type":"noop","mgmt_cfg":"authkey=abc"}"#, peer())
            .unwrap();
        assert!(f.keys.is_empty());
        assert!(f.events.0.lock().is_empty());
    }

    #[test]
    fn flatten_preserves_radio_then_scan_order() {
        let doc = InformDocument::parse(SCAN_DOC.as_bytes()).unwrap();
        let radios = doc.radio_table.unwrap();
        let flat = flatten_neighbors(&radios);
        assert_eq!(flat.len(), 5);
        let bssids: Vec<_> = flat.iter().map(|n| n.bssid.as_deref().unwrap()).collect();
        assert_eq!(
            bssids,
            vec![
                "aa:aa:aa:aa:aa:01",
                "aa:aa:aa:aa:aa:02",
                "bb:bb:bb:bb:bb:01",
                "bb:bb:bb:bb:bb:02",
                "bb:bb:bb:bb:bb:03"
            ]
        );
        assert_eq!(flat[0].bandwidth, Some(20));
        assert_eq!(flat[0].essid.as_deref(), Some("a"));
    }

    #[test]
    fn zero_signal_dropped_and_snr_computed() {
        let doc = InformDocument::parse(SCAN_DOC.as_bytes()).unwrap();
        let radios = doc.radio_table.unwrap();
        let aps = access_points(&flatten_neighbors(&radios));
        assert_eq!(aps.len(), 4);
        assert_eq!(aps[0].mac_address, "aa:aa:aa:aa:aa:01");
        assert_eq!(aps[0].signal_strength, -40.0);
        assert_eq!(aps[0].signal_to_noise_ratio, 55.0);
        assert_eq!(aps[0].channel, 6);
        // numeric strings accepted
        assert_eq!(aps[2].signal_to_noise_ratio, 32.0);
        assert_eq!(aps[2].channel, 44);
    }

    #[test]
    fn one_geolocation_call_per_serial() {
        let f = fixture(FakeGeo::default());
        let h = f.extractor.extract(SCAN_DOC.as_bytes(), peer()).unwrap();
        assert!(h.location.is_some());
        let h = f.extractor.extract(SCAN_DOC.as_bytes(), peer()).unwrap();
        assert!(h.location.is_none());

        let calls = f.geo.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "F09FC2000001");
        assert_eq!(calls[0].1.len(), 4);
        assert!(f.located.contains("F09FC2000001"));
        assert!(matches!(&f.events.0.lock()[0], Event::DeviceLocated { serial, .. } if serial == "F09FC2000001"));
    }

    #[test]
    fn missing_credential_is_quiet_skip() {
        let f = fixture(FakeGeo {
            no_key: true,
            ..Default::default()
        });
        let h = f.extractor.extract(SCAN_DOC.as_bytes(), peer()).unwrap();
        assert!(h.location.is_none());
        assert!(f.events.0.lock().is_empty());
        assert_eq!(f.geo.calls.lock().len(), 1);
    }

    #[test]
    fn no_call_without_usable_neighbors_or_serial() {
        let f = fixture(FakeGeo::default());
        let only_zero = br#"{"serial":"S1","radio_table":[{"scan_table":[{"bssid":"x","signal":0}]}]}"#;
        f.extractor.extract(only_zero, peer()).unwrap();
        let empty_table = br#"{"serial":"S2","radio_table":[]}"#;
        f.extractor.extract(empty_table, peer()).unwrap();
        let no_serial = br#"{"radio_table":[{"scan_table":[{"bssid":"x","signal":-50,"noise":-90}]}]}"#;
        f.extractor.extract(no_serial, peer()).unwrap();

        assert!(f.geo.calls.lock().is_empty());
        assert!(f.located.contains("S1"));
        assert!(!f.located.contains("S2"));
    }

    #[test]
    fn geolocation_disabled_without_geolocator() {
        let located = Arc::new(LocatedDevices::new());
        let extractor = Extractor::new(
            Arc::new(KeyRegistry::new()),
            located.clone(),
            None,
            Arc::new(Events::default()),
        );
        let h = extractor.extract(SCAN_DOC.as_bytes(), peer()).unwrap();
        assert!(h.location.is_none());
        assert!(located.is_empty());
    }
}
