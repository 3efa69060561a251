//! libcurl-backed default transport.
//!
//! Probe is a header-only request; fetch is a (possibly ranged) transfer that
//! writes straight into the destination part file at the resume offset. Both
//! block the calling thread; worker units run them under `spawn_blocking`.

use std::collections::HashMap;
use std::str;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::TransferError;
use crate::storage::PartFile;

use super::parse::parse_header_lines;
use super::{FetchControl, FetchOutcome, FetchRequest, ProbeResult, ProgressFn, Transport};

/// Why the write callback aborted the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Cancel,
    Pause,
    Storage,
}

pub struct HttpTransport {
    connect_timeout: Duration,
    probe_timeout: Duration,
    /// Hard wall-clock cap so a completely stuck transfer eventually fails.
    fetch_timeout: Duration,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(3600),
        }
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn classify_curl(e: &curl::Error) -> TransferError {
    if e.is_operation_timedout()
        || e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return TransferError::Network(e.to_string());
    }
    TransferError::Internal(format!("curl: {}", e))
}

fn apply_headers(
    easy: &mut curl::easy::Easy,
    headers: &HashMap<String, String>,
    extra: Option<(&str, &str)>,
) -> Result<(), TransferError> {
    if headers.is_empty() && extra.is_none() {
        return Ok(());
    }
    let mut list = curl::easy::List::new();
    for (k, v) in headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(|e| classify_curl(&e))?;
    }
    if let Some((k, v)) = extra {
        list.append(&format!("{}: {}", k, v))
            .map_err(|e| classify_curl(&e))?;
    }
    easy.http_headers(list).map_err(|e| classify_curl(&e))
}

impl Transport for HttpTransport {
    fn probe(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<ProbeResult, TransferError> {
        let mut lines: Vec<String> = Vec::new();

        let mut easy = curl::easy::Easy::new();
        easy.url(url).map_err(|e| classify_curl(&e))?;
        easy.nobody(true).map_err(|e| classify_curl(&e))?;
        easy.follow_location(true).map_err(|e| classify_curl(&e))?;
        easy.connect_timeout(self.connect_timeout)
            .map_err(|e| classify_curl(&e))?;
        easy.timeout(self.probe_timeout).map_err(|e| classify_curl(&e))?;
        apply_headers(&mut easy, headers, None)?;

        {
            let mut transfer = easy.transfer();
            transfer
                .header_function(|data| {
                    if let Ok(s) = str::from_utf8(data) {
                        lines.push(s.trim_end().to_string());
                    }
                    true
                })
                .map_err(|e| classify_curl(&e))?;
            transfer.perform().map_err(|e| classify_curl(&e))?;
        }

        let code = easy.response_code().map_err(|e| classify_curl(&e))? as u32;
        if code == 404 {
            return Err(TransferError::NotFound);
        }
        if !(200..300).contains(&code) {
            return Err(TransferError::HttpStatus { code, body: None });
        }

        let info = parse_header_lines(&lines);
        Ok(ProbeResult {
            status_code: code,
            content_length: info.content_length,
            accept_ranges: info.accept_ranges,
            etag: info.etag,
            last_modified: info.last_modified,
        })
    }

    fn fetch(
        &self,
        request: &FetchRequest,
        control: &FetchControl,
        progress: ProgressFn<'_>,
    ) -> Result<FetchOutcome, TransferError> {
        let part = if request.start_byte > 0 {
            PartFile::open_existing(&request.dest)?
        } else {
            PartFile::create(&request.dest, request.range.map(|(f, t)| t - f + 1))?
        };

        let bytes = Arc::new(AtomicU64::new(0));
        let session_total: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let abort: Arc<Mutex<Option<Abort>>> = Arc::new(Mutex::new(None));
        let storage_error: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));
        let lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut easy = curl::easy::Easy::new();
        easy.url(&request.url).map_err(|e| classify_curl(&e))?;
        easy.follow_location(true).map_err(|e| classify_curl(&e))?;
        easy.max_redirections(10).map_err(|e| classify_curl(&e))?;
        easy.connect_timeout(self.connect_timeout)
            .map_err(|e| classify_curl(&e))?;
        // Abort if throughput drops below 1 KiB/s for 60s; kinder to large
        // transfers on slow links than a tight wall-clock timeout.
        easy.low_speed_limit(1024).map_err(|e| classify_curl(&e))?;
        easy.low_speed_time(Duration::from_secs(60))
            .map_err(|e| classify_curl(&e))?;
        easy.timeout(self.fetch_timeout).map_err(|e| classify_curl(&e))?;

        match (request.range, request.start_byte) {
            (Some((from, to)), _) => {
                easy.range(&format!("{}-{}", from, to))
                    .map_err(|e| classify_curl(&e))?;
            }
            (None, start) if start > 0 => {
                easy.resume_from(start).map_err(|e| classify_curl(&e))?;
            }
            _ => {}
        }

        if request.method != "GET" && request.body.is_none() {
            easy.custom_request(&request.method)
                .map_err(|e| classify_curl(&e))?;
        }
        if let Some(body) = &request.body {
            easy.post(true).map_err(|e| classify_curl(&e))?;
            easy.post_fields_copy(body.as_bytes())
                .map_err(|e| classify_curl(&e))?;
            if request.method != "POST" {
                easy.custom_request(&request.method)
                    .map_err(|e| classify_curl(&e))?;
            }
        }

        let if_range = request
            .validator
            .as_deref()
            .filter(|_| request.start_byte > 0)
            .map(|v| ("If-Range", v));
        apply_headers(&mut easy, &request.headers, if_range)?;

        {
            let part_cb = part.clone();
            let bytes_cb = Arc::clone(&bytes);
            let total_cb = Arc::clone(&session_total);
            let abort_cb = Arc::clone(&abort);
            let storage_cb = Arc::clone(&storage_error);
            let control_cb = control.clone();
            let start_byte = request.start_byte;

            let mut transfer = easy.transfer();
            transfer
                .header_function({
                    let total = Arc::clone(&session_total);
                    let lines = Arc::clone(&lines);
                    move |data| {
                        if let Ok(s) = str::from_utf8(data) {
                            let line = s.trim_end();
                            if line.to_ascii_uppercase().starts_with("HTTP/") {
                                *total.lock().unwrap() = None;
                            } else if let Some((name, value)) = line.split_once(':') {
                                if name.trim().eq_ignore_ascii_case("content-length") {
                                    *total.lock().unwrap() = value.trim().parse::<u64>().ok();
                                }
                            }
                            lines.lock().unwrap().push(line.to_string());
                        }
                        true
                    }
                })
                .map_err(|e| classify_curl(&e))?;
            transfer
                .write_function(move |data| {
                    if control_cb.cancel_requested() {
                        *abort_cb.lock().unwrap() = Some(Abort::Cancel);
                        return Ok(0);
                    }
                    if control_cb.pause_requested() {
                        *abort_cb.lock().unwrap() = Some(Abort::Pause);
                        return Ok(0);
                    }
                    let off = bytes_cb.fetch_add(data.len() as u64, Ordering::Relaxed);
                    if let Err(e) = part_cb.write_at(start_byte + off, data) {
                        *abort_cb.lock().unwrap() = Some(Abort::Storage);
                        *storage_cb.lock().unwrap() = Some(e);
                        return Ok(0);
                    }
                    let done = off + data.len() as u64;
                    progress(done, *total_cb.lock().unwrap());
                    Ok(data.len())
                })
                .map_err(|e| classify_curl(&e))?;

            if let Err(e) = transfer.perform() {
                if e.is_write_error() || e.is_aborted_by_callback() {
                    let why = abort.lock().unwrap().take();
                    match why {
                        Some(Abort::Cancel) => {
                            drop(part);
                            let _ = std::fs::remove_file(&request.dest);
                            return Ok(FetchOutcome::Canceled);
                        }
                        Some(Abort::Pause) if request.allow_pause => {
                            part.sync()?;
                            let start_byte = part.len()?;
                            let info = parse_header_lines(&lines.lock().unwrap());
                            return Ok(FetchOutcome::Paused {
                                token: request.dest.to_string_lossy().to_string(),
                                start_byte,
                                validator: info.validator().or_else(|| request.validator.clone()),
                            });
                        }
                        // Pause requested on a task that does not allow it:
                        // treat as cancel.
                        Some(Abort::Pause) => {
                            drop(part);
                            let _ = std::fs::remove_file(&request.dest);
                            return Ok(FetchOutcome::Canceled);
                        }
                        Some(Abort::Storage) => {
                            let err = storage_error
                                .lock()
                                .unwrap()
                                .take()
                                .unwrap_or_else(|| TransferError::Filesystem("write failed".into()));
                            return Err(err);
                        }
                        None => {}
                    }
                }
                return Err(classify_curl(&e));
            }
        }

        let code = easy.response_code().map_err(|e| classify_curl(&e))? as u32;
        if code == 404 {
            drop(part);
            let _ = std::fs::remove_file(&request.dest);
            return Ok(FetchOutcome::NotFound { response_body: None });
        }
        if !(200..300).contains(&code) {
            drop(part);
            let _ = std::fs::remove_file(&request.dest);
            return Err(TransferError::HttpStatus { code, body: None });
        }

        let written = bytes.load(Ordering::Relaxed);
        if let Some(expected) = *session_total.lock().unwrap() {
            if written < expected {
                // Server closed early; retryable rather than silent corruption.
                return Err(TransferError::Network(format!(
                    "partial transfer: {} of {} bytes",
                    written, expected
                )));
            }
        }

        part.sync()?;
        let info = parse_header_lines(&lines.lock().unwrap());
        Ok(FetchOutcome::Complete {
            response_headers: info.all,
            response_body: None,
        })
    }
}
