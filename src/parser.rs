//! Status document parsing and server software classification.
//!
//! The JSON a server returns is untrusted and only loosely shaped, so
//! everything is parsed defensively: the document lands in a
//! [`serde_json::Value`] first and typed fields are pulled out one by one.
//! `version` and `players` are the only mandatory keys; every other field
//! degrades silently to a default while the raw document is retained.

use crate::errors::ProtocolErrorKind;
use crate::model::{ModEntry, OnlineModeGuess, SamplePlayer, ServerDocument, Software};
use base64::Engine as _;
use md5::{Digest as _, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

/// Bare vanilla versions look like `1.20` or `1.20.4`, nothing else.
static VANILLA_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^1\.\d+(\.\d+)?$").expect("static pattern"));

/// `§x` and `&x` legacy formatting codes.
static FORMATTING_CODES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[§&][0-9a-fk-orA-FK-OR]").expect("static pattern"));

/// Nested chat components beyond this depth are ignored.
const MAX_MOTD_DEPTH: usize = 10;

/// Parsing knobs carried over from the storage config.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Keep decoded favicon bytes on the document (the hash is always kept)
    pub store_favicon_bytes: bool,
}

/// Parse a raw status JSON string into a [`ServerDocument`].
pub fn parse_status_json(raw: &str, opts: ParseOptions) -> Result<ServerDocument, ProtocolErrorKind> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ProtocolErrorKind::BadJson)?;
    parse_status_value(value, opts)
}

/// Parse an already-decoded status document.
pub fn parse_status_value(
    value: Value,
    opts: ParseOptions,
) -> Result<ServerDocument, ProtocolErrorKind> {
    let version = value.get("version").ok_or(ProtocolErrorKind::BadJson)?;
    let players = value.get("players").ok_or(ProtocolErrorKind::BadJson)?;

    let version_name = version
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();
    // 0 is the unknown sentinel; ScanResult promises a non-negative id
    let protocol_id = version
        .get("protocol")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        .max(0) as i32;

    let players_online = players.get("online").and_then(Value::as_i64).unwrap_or(0);
    let players_max = players.get("max").and_then(Value::as_i64).unwrap_or(0);
    let player_sample = extract_sample(players);

    let (motd_raw, motd_plain) = flatten_motd(value.get("description"));
    let mods = extract_mods(&value);
    let is_modded = value
        .get("isModded")
        .or_else(|| value.get("modded"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || !mods.is_empty();

    let (favicon_hash, favicon_bytes) = match value.get("favicon").and_then(Value::as_str) {
        Some(data_uri) => decode_favicon(data_uri, opts.store_favicon_bytes),
        None => (None, None),
    };

    Ok(ServerDocument {
        protocol_id,
        version_name,
        motd_plain,
        motd_raw,
        players_online,
        players_max,
        player_sample,
        mods,
        is_modded,
        prevents_chat_reports: value.get("preventsChatReports").and_then(Value::as_bool),
        enforces_secure_chat: value.get("enforcesSecureChat").and_then(Value::as_bool),
        favicon_hash,
        favicon_bytes,
        raw: value,
    })
}

/// Classify server software from the document and version string.
///
/// Tests run in a fixed order; the first hit wins. A bare `1.x[.y]`
/// version with no other markers is vanilla, anything unrecognized stays
/// unknown with the raw string preserved on the document.
pub fn classify_software(doc: &ServerDocument) -> Software {
    let raw = &doc.raw;
    let name = doc.version_name.to_lowercase();

    if raw.get("forgeData").is_some() || name.contains("forge") {
        return Software::Forge;
    }
    if raw
        .get("modinfo")
        .and_then(|m| m.get("type"))
        .and_then(Value::as_str)
        == Some("FML")
    {
        return Software::Forge;
    }
    if name.contains("fabric") {
        return Software::Fabric;
    }
    if name.contains("paper") {
        return Software::Paper;
    }
    if name.contains("purpur") {
        return Software::Purpur;
    }
    if name.contains("folia") {
        return Software::Folia;
    }
    if name.contains("spigot") {
        return Software::Spigot;
    }
    if name.contains("bukkit") {
        return Software::Bukkit;
    }
    if name.contains("velocity") {
        return Software::Velocity;
    }
    if name.contains("bungee") {
        return Software::Bungeecord;
    }
    if VANILLA_VERSION.is_match(doc.version_name.trim()) {
        return Software::Vanilla;
    }
    Software::Unknown
}

/// Guess whether the server authenticates players, purely from the sample
/// UUIDs: an offline-derived UUID marks the server likely offline, an
/// all-v4 sample likely online, anything empty or ambiguous stays unknown.
pub fn guess_online_mode(doc: &ServerDocument) -> OnlineModeGuess {
    let mut saw_v4 = false;
    let mut saw_other = false;

    for player in &doc.player_sample {
        let Ok(parsed) = Uuid::parse_str(&player.uuid) else {
            saw_other = true;
            continue;
        };
        if parsed == offline_uuid(&player.name) {
            return OnlineModeGuess::LikelyOffline;
        }
        match parsed.get_version_num() {
            4 => saw_v4 = true,
            _ => saw_other = true,
        }
    }

    if saw_v4 && !saw_other {
        return OnlineModeGuess::LikelyOnline;
    }
    OnlineModeGuess::Unknown
}

/// The UUID an offline-mode server derives for a player name: UUIDv3 over
/// MD5 of the literal bytes `OfflinePlayer:<name>`, following Java's
/// `UUID.nameUUIDFromBytes`.
pub fn offline_uuid(name: &str) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(b"OfflinePlayer:");
    hasher.update(name.as_bytes());
    let mut bytes: [u8; 16] = hasher.finalize().into();
    bytes[6] = (bytes[6] & 0x0F) | 0x30;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Normalize a parsed document into the canonical record handed to the
/// module pipeline.
pub fn build_result(
    ip: std::net::IpAddr,
    port: u16,
    doc: ServerDocument,
    latency_ms: u64,
) -> crate::model::ScanResult {
    let software = classify_software(&doc);
    let online_mode_guess = guess_online_mode(&doc);
    let count_mismatch = doc.players_online > doc.players_max + 1;
    crate::model::ScanResult {
        ip,
        port,
        discovered_at: time::OffsetDateTime::now_utc(),
        // 0 stands in for unknown; the record never carries a negative id
        protocol_id: doc.protocol_id.max(0),
        software,
        version_string: doc.version_name,
        motd_plain: doc.motd_plain,
        motd_raw: doc.motd_raw,
        players_online: doc.players_online,
        players_max: doc.players_max,
        player_sample: doc.player_sample,
        mods: doc.mods,
        favicon_hash: doc.favicon_hash,
        favicon_bytes: doc.favicon_bytes,
        latency_ms,
        online_mode_guess,
        count_mismatch,
        raw_document: doc.raw,
        country_code: None,
    }
}

fn extract_sample(players: &Value) -> Vec<SamplePlayer> {
    let Some(sample) = players.get("sample").and_then(Value::as_array) else {
        return Vec::new();
    };
    sample
        .iter()
        .filter_map(|entry| {
            let name = entry.get("name").and_then(Value::as_str)?;
            let uuid = entry.get("id").and_then(Value::as_str)?;
            Some(SamplePlayer {
                name: name.to_string(),
                uuid: uuid.to_string(),
            })
        })
        .collect()
}

/// Flatten the `description` field into (raw, plain) forms.
fn flatten_motd(description: Option<&Value>) -> (String, String) {
    let Some(description) = description else {
        return (String::new(), String::new());
    };
    let raw = match description {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };
    let mut flat = String::new();
    collect_motd_text(description, 0, &mut flat);
    (raw, clean_formatting(&flat))
}

fn collect_motd_text(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_MOTD_DEPTH {
        return;
    }
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            for item in items {
                collect_motd_text(item, depth + 1, out);
            }
        }
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                out.push_str(text);
            }
            if let Some(extra) = map.get("extra") {
                collect_motd_text(extra, depth + 1, out);
            }
            if let Some(with) = map.get("with") {
                collect_motd_text(with, depth + 1, out);
            }
        }
        _ => {}
    }
}

/// Strip `§x`/`&x` codes and collapse runs of whitespace.
fn clean_formatting(text: &str) -> String {
    let stripped = FORMATTING_CODES.replace_all(text, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract mods from the modern and legacy Forge payloads, plus the Fabric
/// and NeoForge shapes a few servers expose. Deduplicated by id, first
/// version wins.
fn extract_mods(value: &Value) -> Vec<ModEntry> {
    let mut mods: Vec<ModEntry> = Vec::new();
    let mut push = |id: Option<&str>, version: Option<&str>| {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return;
        };
        if mods.iter().any(|m| m.mod_id == id) {
            return;
        }
        mods.push(ModEntry {
            mod_id: id.to_string(),
            version: version.unwrap_or_default().to_string(),
        });
    };

    if let Some(list) = value
        .get("forgeData")
        .and_then(|f| f.get("mods"))
        .and_then(Value::as_array)
    {
        for entry in list {
            push(
                entry.get("modId").and_then(Value::as_str),
                entry
                    .get("modmarker")
                    .or_else(|| entry.get("version"))
                    .and_then(Value::as_str),
            );
        }
    }
    if let Some(list) = value
        .get("modinfo")
        .and_then(|f| f.get("modList"))
        .and_then(Value::as_array)
    {
        for entry in list {
            push(
                entry.get("modid").and_then(Value::as_str),
                entry.get("version").and_then(Value::as_str),
            );
        }
    }
    if let Some(list) = value.get("fabricMods").and_then(Value::as_array) {
        for entry in list {
            push(
                entry.get("id").and_then(Value::as_str),
                entry.get("version").and_then(Value::as_str),
            );
        }
    }
    if let Some(list) = value
        .get("neoForgeData")
        .and_then(|f| f.get("mods"))
        .and_then(Value::as_array)
    {
        for entry in list {
            push(
                entry.get("modId").and_then(Value::as_str),
                entry.get("version").and_then(Value::as_str),
            );
        }
    }
    mods
}

/// Decode a `data:image/png;base64,` favicon and hash its content.
fn decode_favicon(data_uri: &str, keep_bytes: bool) -> (Option<String>, Option<Vec<u8>>) {
    let payload = data_uri
        .strip_prefix("data:image/png;base64,")
        .unwrap_or(data_uri);
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(payload.trim()) else {
        return (None, None);
    };
    let digest = Sha256::digest(&bytes);
    let hash = digest.iter().map(|b| format!("{b:02x}")).collect();
    let retained = keep_bytes.then_some(bytes);
    (Some(hash), retained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> ServerDocument {
        parse_status_value(value, ParseOptions::default()).unwrap()
    }

    #[test]
    fn vanilla_status_parses() {
        let doc = doc(json!({
            "version": {"name": "1.21", "protocol": 767},
            "players": {"max": 20, "online": 0, "sample": []},
            "description": "Hello"
        }));
        assert_eq!(doc.version_name, "1.21");
        assert_eq!(doc.protocol_id, 767);
        assert_eq!(doc.players_max, 20);
        assert_eq!(doc.players_online, 0);
        assert_eq!(doc.motd_plain, "Hello");
        assert_eq!(classify_software(&doc), Software::Vanilla);
    }

    #[test]
    fn missing_mandatory_fields_fail() {
        assert_eq!(
            parse_status_value(json!({"players": {}}), ParseOptions::default()).unwrap_err(),
            ProtocolErrorKind::BadJson
        );
        assert_eq!(
            parse_status_value(json!({"version": {}}), ParseOptions::default()).unwrap_err(),
            ProtocolErrorKind::BadJson
        );
    }

    #[test]
    fn optional_fields_degrade_silently() {
        let doc = doc(json!({"version": {}, "players": {}}));
        assert_eq!(doc.version_name, "Unknown");
        assert_eq!(doc.protocol_id, 0);
        assert_eq!(doc.players_online, 0);
        assert!(doc.player_sample.is_empty());
    }

    #[test]
    fn paper_with_v4_sample_is_likely_online() {
        let doc = doc(json!({
            "version": {"name": "Paper 1.20.1", "protocol": 763},
            "players": {"max": 100, "online": 1, "sample": [
                {"name": "Alice", "id": "a0000000-0000-4000-8000-000000000001"}
            ]}
        }));
        assert_eq!(classify_software(&doc), Software::Paper);
        assert_eq!(guess_online_mode(&doc), OnlineModeGuess::LikelyOnline);
    }

    #[test]
    fn offline_derived_uuid_is_likely_offline() {
        let cracked = offline_uuid("Steve").to_string();
        let doc = doc(json!({
            "version": {"name": "1.8.8", "protocol": 47},
            "players": {"max": 50, "online": 1, "sample": [
                {"name": "Steve", "id": cracked}
            ]}
        }));
        assert_eq!(guess_online_mode(&doc), OnlineModeGuess::LikelyOffline);
    }

    #[test]
    fn offline_uuid_matches_java_derivation() {
        // UUID.nameUUIDFromBytes("OfflinePlayer:Notch".getBytes(UTF_8))
        assert_eq!(
            offline_uuid("Notch").to_string(),
            "b50ad385-829d-3141-a216-7e7d7539ba7f"
        );
        assert_eq!(offline_uuid("Notch").get_version_num(), 3);
    }

    #[test]
    fn empty_or_ambiguous_sample_is_unknown() {
        // the banner plays no part in the guess, even when it advertises
        // a cracked server
        let plain = doc(json!({
            "version": {"name": "1.21", "protocol": 767},
            "players": {"max": 20, "online": 0},
            "description": "Best CRACKED server"
        }));
        assert_eq!(guess_online_mode(&plain), OnlineModeGuess::Unknown);

        let mixed = doc(json!({
            "version": {"name": "1.21", "protocol": 767},
            "players": {"max": 20, "online": 2, "sample": [
                {"name": "Alice", "id": "a0000000-0000-4000-8000-000000000001"},
                {"name": "Bob", "id": "not-a-uuid"}
            ]}
        }));
        assert_eq!(guess_online_mode(&mixed), OnlineModeGuess::Unknown);
    }

    #[test]
    fn forge_mods_deduplicate_keeping_first_version() {
        let doc = doc(json!({
            "version": {"name": "1.20.1", "protocol": 763},
            "players": {"max": 20, "online": 0},
            "forgeData": {"mods": [
                {"modId": "jei", "modmarker": "15.2.0"},
                {"modId": "jei", "modmarker": "15.2.0"},
                {"modId": "create", "modmarker": "0.5.1"}
            ]}
        }));
        assert_eq!(classify_software(&doc), Software::Forge);
        assert_eq!(
            doc.mods,
            vec![
                ModEntry {
                    mod_id: "jei".into(),
                    version: "15.2.0".into()
                },
                ModEntry {
                    mod_id: "create".into(),
                    version: "0.5.1".into()
                },
            ]
        );
        assert!(doc.is_modded);
    }

    #[test]
    fn legacy_fml_modinfo_classifies_as_forge() {
        let doc = doc(json!({
            "version": {"name": "1.12.2", "protocol": 340},
            "players": {"max": 20, "online": 0},
            "modinfo": {"type": "FML", "modList": [
                {"modid": "thaumcraft", "version": "6.1.BETA26"}
            ]}
        }));
        assert_eq!(classify_software(&doc), Software::Forge);
        assert_eq!(doc.mods[0].mod_id, "thaumcraft");
    }

    #[test]
    fn classification_order_prefers_forge_over_paper() {
        let doc = doc(json!({
            "version": {"name": "Paper 1.20.1", "protocol": 763},
            "players": {"max": 20, "online": 0},
            "forgeData": {"mods": []}
        }));
        assert_eq!(classify_software(&doc), Software::Forge);
    }

    #[test]
    fn proxy_and_unknown_classification() {
        let velocity = doc(json!({
            "version": {"name": "Velocity 3.3.0", "protocol": 767},
            "players": {"max": 500, "online": 12}
        }));
        assert_eq!(classify_software(&velocity), Software::Velocity);

        let weird = doc(json!({
            "version": {"name": "SuperCustomCore 9000", "protocol": 767},
            "players": {"max": 20, "online": 0}
        }));
        assert_eq!(classify_software(&weird), Software::Unknown);
        assert_eq!(weird.version_name, "SuperCustomCore 9000");
    }

    #[test]
    fn structured_motd_flattens_depth_first_and_strips_codes() {
        let doc = doc(json!({
            "version": {"name": "1.21", "protocol": 767},
            "players": {"max": 20, "online": 0},
            "description": {
                "text": "§6Welcome ",
                "extra": [
                    {"text": "to §athe ", "extra": [{"text": "best"}]},
                    {"text": " server"}
                ]
            }
        }));
        assert_eq!(doc.motd_plain, "Welcome to the best server");
        assert!(doc.motd_raw.starts_with('{'));
    }

    #[test]
    fn favicon_is_hashed_and_bytes_dropped_by_default() {
        let payload = base64::engine::general_purpose::STANDARD.encode(b"\x89PNG fake");
        let doc = doc(json!({
            "version": {"name": "1.21", "protocol": 767},
            "players": {"max": 20, "online": 0},
            "favicon": format!("data:image/png;base64,{payload}")
        }));
        let hash = doc.favicon_hash.expect("hash present");
        assert_eq!(hash.len(), 64);
        assert!(doc.favicon_bytes.is_none());

        let kept = parse_status_value(
            doc.raw.clone(),
            ParseOptions {
                store_favicon_bytes: true,
            },
        )
        .unwrap();
        assert_eq!(kept.favicon_bytes.as_deref(), Some(&b"\x89PNG fake"[..]));
    }
}
