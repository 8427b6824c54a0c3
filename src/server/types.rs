use warp::reply::Response;
use warp::{http, Reply};

use crate::scheduler::{PlayoutState, PlayoutStatus};

/// A file read out of the output sink.
pub(crate) struct SinkFile {
    pub(crate) data: Vec<u8>,
    pub(crate) content_type: &'static str,
}

impl SinkFile {
    /// Content type by extension, as HLS players expect it.
    pub(crate) fn content_type_for(name: &str) -> &'static str {
        match name.rsplit_once('.').map(|(_, ext)| ext) {
            Some("m3u8") => "application/x-mpegURL",
            Some("ts") => "video/MP2T",
            Some("m4s") | Some("mp4") => "video/mp4",
            _ => "application/octet-stream",
        }
    }
}

impl Reply for SinkFile {
    fn into_response(self) -> Response {
        let mut response = Response::new(self.data.into());
        let headers = response.headers_mut();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(self.content_type),
        );
        // The manifest is rewritten continuously.
        headers.insert(
            http::header::CACHE_CONTROL,
            http::HeaderValue::from_static("no-cache"),
        );

        response
    }
}

pub(crate) struct StatusPage {
    pub(crate) status: PlayoutStatus,
    pub(crate) manifest_url: String,
}

impl Reply for StatusPage {
    fn into_response(self) -> Response {
        let status = &self.status;
        let state = match status.state {
            PlayoutState::Idle => "idle",
            PlayoutState::AwaitingSlot => "awaiting slot",
            PlayoutState::Streaming => "streaming",
            PlayoutState::Interrupted => "interrupted",
        };

        let mut body = String::new();
        body.push_str("<!doctype html>\n<title>Playout status</title>\n");
        body.push_str("<h2>Playout status</h2>\n<table>\n");
        row(&mut body, "State", state);
        row(&mut body, "Show", status.show.as_deref().unwrap_or("-"));
        row(&mut body, "Asset", status.asset.as_deref().unwrap_or("-"));
        if let Some(index) = status.index {
            row(&mut body, "Episode", &index.to_string());
        }
        if let Some(offset) = status.start_offset {
            row(&mut body, "Started at offset", &format!("{offset:.1}s"));
        }
        if let Some(duration) = status.play_duration {
            row(&mut body, "Window", &format!("{duration:.1}s"));
        }
        if let Some(end) = status.slot_end {
            row(&mut body, "Slot ends", &end.to_rfc3339());
        }
        body.push_str("</table>\n");
        body.push_str(&format!(
            "<p><a href=\"{0}\">{0}</a></p>\n",
            escape(&self.manifest_url)
        ));

        http::Response::builder()
            .header("content-type", "text/html; charset=utf-8")
            .body(body.into())
            .unwrap_or_default()
    }
}

fn row(body: &mut String, label: &str, value: &str) {
    body.push_str(&format!(
        "<tr><th>{}</th><td>{}</td></tr>\n",
        label,
        escape(value)
    ));
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
