//! Input descriptor model.
//!
//! The descriptor carries per-itag URL maps for audio and video, stream
//! metadata (including a base64 data-URI thumbnail) and the creation info.
//! Format selection scans a fixed preference ladder and only falls back to
//! "highest itag wins" when guessing is allowed.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

const BEST_VIDEO_FORMATS: &[i32] = &[
    337, 315, 266, 138, // 2160p60
    313, 336, // 2160p
    308, // 1440p60
    271, 264, // 1440p
    335, 303, 299, // 1080p60
    248, 169, 137, // 1080p
    334, 302, 298, // 720p60
    247, 136, // 720p
];

const BEST_AUDIO_FORMATS: &[i32] = &[251, 141, 171, 140, 250, 249, 139];

fn video_format_name(itag: i32) -> Option<&'static str> {
    Some(match itag {
        337 => "2160p60 VP9 HDR",
        315 => "2160p60 VP9",
        266 | 138 => "2160p60 H264",
        313 => "2160p VP9",
        336 => "1440p60 VP9 HDR",
        308 => "1440p60 VP9",
        271 => "1440p VP9",
        264 => "1440p H264",
        335 => "1080p60 VP9 HDR",
        303 => "1080p60 VP9",
        299 => "1080p60 H264",
        248 => "1080p VP9",
        169 => "1080p VP8",
        137 => "1080p H264",
        334 => "720p60 VP9 HDR",
        302 => "720p60 VP9",
        298 => "720p60 H264",
        247 => "720p VP9",
        136 => "720p H264",
        _ => return None,
    })
}

fn audio_format_name(itag: i32) -> Option<&'static str> {
    Some(match itag {
        251 => "Opus 160 Kbps",
        141 => "AAC 256 Kbps",
        171 => "Opus 128 Kbps",
        140 => "AAC 128 Kbps",
        250 => "Opus 70 Kbps",
        249 => "Opus 50 Kbps",
        139 => "AAC 48 Kbps",
        _ => return None,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FregMetadata {
    pub title: String,
    pub id: String,
    #[serde(rename = "channelName")]
    pub channel_name: String,
    #[serde(rename = "channelURL")]
    pub channel_url: String,
    #[serde(default)]
    pub description: String,
    /// Base64 data-URI of the thumbnail image.
    #[serde(default)]
    pub thumbnail: String,
    #[serde(rename = "thumbnailUrl", default)]
    pub thumbnail_url: String,
    #[serde(rename = "startTimestamp")]
    pub start_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FregJson {
    #[serde(
        serialize_with = "serialize_itag_map",
        deserialize_with = "deserialize_itag_map"
    )]
    pub video: BTreeMap<i32, String>,
    #[serde(
        serialize_with = "serialize_itag_map",
        deserialize_with = "deserialize_itag_map"
    )]
    pub audio: BTreeMap<i32, String>,
    pub metadata: FregMetadata,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "createTime")]
    pub create_time: DateTime<Utc>,
}

// itag keys arrive as JSON strings ("140": "<url>"); expose them as integers.
fn deserialize_itag_map<'de, D>(deserializer: D) -> Result<BTreeMap<i32, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (k, v) in raw {
        let itag: i32 = k
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("non-integer itag key '{k}'")))?;
        out.insert(itag, v);
    }
    Ok(out)
}

fn serialize_itag_map<S>(map: &BTreeMap<i32, String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut m = serializer.serialize_map(Some(map.len()))?;
    for (k, v) in map {
        m.serialize_entry(&k.to_string(), v)?;
    }
    m.end()
}

fn pick_best_id(urls: &BTreeMap<i32, String>, order: &[i32], guess: bool) -> Result<i32> {
    for &itag in order {
        if urls.contains_key(&itag) {
            return Ok(itag);
        }
    }
    if guess {
        tracing::warn!(
            "unable to find best format, choosing highest itag value as a guess for best codec"
        );
        if let Some((&max, _)) = urls.iter().next_back() {
            return Ok(max);
        }
    }
    bail!("unable to find a suitable codec (tried {order:?})")
}

fn pick_best<'a>(
    urls: &'a BTreeMap<i32, String>,
    preferred: Option<&[i32]>,
    default_order: &[i32],
    name_of: fn(i32) -> Option<&'static str>,
    which: &str,
) -> Result<&'a str> {
    let (order, guess) = match preferred {
        Some(order) => (order, false),
        None => (default_order, true),
    };
    let itag = pick_best_id(urls, order, guess)?;
    let name = name_of(itag).unwrap_or("unknown codec");
    tracing::info!("using format {} ({}) for {}", itag, name, which);
    Ok(&urls[&itag])
}

impl FregJson {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read file '{}'", path.display()))?;
        serde_json::from_str(&data).context("unable to parse descriptor json")
    }

    pub fn best_video(&self, preferred: Option<&[i32]>) -> Result<&str> {
        pick_best(
            &self.video,
            preferred,
            BEST_VIDEO_FORMATS,
            video_format_name,
            "video",
        )
    }

    pub fn best_audio(&self, preferred: Option<&[i32]>) -> Result<&str> {
        pick_best(
            &self.audio,
            preferred,
            BEST_AUDIO_FORMATS,
            audio_format_name,
            "audio",
        )
    }

    fn format_vals(&self) -> Result<HashMap<&'static str, String>> {
        let mut vals = HashMap::new();
        let meta = &self.metadata;
        vals.insert("id", meta.id.clone());
        vals.insert("url", format!("https://youtu.be/{}", meta.id));
        vals.insert("title", meta.title.clone());
        vals.insert("channel", meta.channel_name.clone());
        let date = meta.start_timestamp.format("%Y%m%d").to_string();
        vals.insert("upload_date", date.clone());
        vals.insert("start_date", date.clone());
        vals.insert("publish_date", date);
        vals.insert("start_timestamp", meta.start_timestamp.to_rfc3339());
        vals.insert("description", meta.description.clone());

        let channel_re = Regex::new(r"^https?://(?:www\.)?youtube\.com/channel/([A-Za-z0-9_-]+)$")
            .context("channel URL pattern")?;
        let captures = channel_re
            .captures(&meta.channel_url)
            .with_context(|| format!("unable to parse channel url '{}'", meta.channel_url))?;
        vals.insert("channel_url", meta.channel_url.clone());
        vals.insert("channel_id", captures[1].to_string());

        Ok(vals)
    }

    /// Substitutes `%(key)s` template markers. With `filename` set, values
    /// are sanitized for the filesystem and the long free-text keys
    /// (description, url, channel_url) become empty.
    pub fn format_template(&self, template: &str, filename: bool) -> Result<String> {
        let vals = self.format_vals()?;
        let key_re = Regex::new(r"%\((\w+)\)s").context("template key pattern")?;

        let mut out = template.to_string();
        while let Some(m) = key_re.captures(&out) {
            let full = m.get(0).map(|g| g.as_str().to_string()).unwrap_or_default();
            let key = m[1].to_ascii_lowercase();
            let Some(val) = vals.get(key.as_str()) else {
                bail!("unknown format key '{key}'");
            };
            let mut val = val.clone();
            if filename {
                if key == "description" || key == "url" || key == "channel_url" {
                    val.clear();
                }
                val = sanitize_filename(&val);
            }
            out = out.replace(&full, &val);
        }
        Ok(out)
    }

    /// Decodes the data-URI thumbnail and writes it to `path`, synced.
    pub fn write_thumbnail(&self, path: &Path) -> Result<()> {
        let b64 = &self.metadata.thumbnail;
        let b64 = match b64.find(',') {
            Some(idx) => &b64[idx + 1..],
            None => b64.as_str(),
        };

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .context("unable to decode thumbnail")?;

        let mut file = std::fs::File::create(path)
            .with_context(|| format!("unable to create {}", path.display()))?;
        use std::io::Write;
        file.write_all(&decoded)
            .with_context(|| format!("unable to write {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("unable to sync {}", path.display()))?;
        Ok(())
    }
}

fn sanitize_filename(s: &str) -> String {
    s.replace(
        ['<', '>', ':', '"', '/', '\\', '|', '?', '*'],
        "_",
    )
}
