use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use walkdir::WalkDir;

use crate::api::{QueryGenerator, Request};
use crate::error::{Result, WikiError};
use crate::http::FilePart;
use crate::login::TokenKind;
use crate::namespace::NS_FILE;
use crate::site::Site;
use crate::title::Title;

#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
    Url(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IgnoreWarnings {
    #[default]
    None,
    All,
    Only(Vec<String>),
}

impl IgnoreWarnings {
    fn ignores(&self, codes: &[String]) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Only(allowed) => codes.iter().all(|code| allowed.contains(code)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Target name without the `File:` prefix.
    pub filename: String,
    pub comment: String,
    /// Description page text for new files.
    pub text: Option<String>,
    /// Bytes per chunk; 0 uploads in one request.
    pub chunk_size: usize,
    pub ignore_warnings: IgnoreWarnings,
    pub watch: bool,
    pub max_chunk_retries: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            filename: String::new(),
            comment: String::new(),
            text: None,
            chunk_size: 0,
            ignore_warnings: IgnoreWarnings::None,
            watch: false,
            max_chunk_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadOutcome {
    pub filename: String,
    pub filekey: Option<String>,
    pub warnings: Vec<String>,
    pub image_info: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub title: String,
    pub url: Option<String>,
    pub description_url: Option<String>,
    pub size: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub sha1: Option<String>,
    pub mime: Option<String>,
    pub timestamp: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawUpload {
    result: Option<String>,
    filename: Option<String>,
    filekey: Option<String>,
    offset: Option<u64>,
    #[serde(default)]
    warnings: Option<Value>,
    imageinfo: Option<Value>,
}

impl RawUpload {
    fn from_payload(payload: &Value) -> Result<Self> {
        let upload = payload
            .get("upload")
            .cloned()
            .ok_or_else(|| WikiError::Upload("response has no upload result".to_string()))?;
        Ok(serde_json::from_value(upload)?)
    }

    fn warning_codes(&self) -> Vec<String> {
        match &self.warnings {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

/// Errors worth resending the same chunk for.
fn chunk_retryable(error: &WikiError) -> bool {
    error.is_retryable()
        || matches!(
            error.code(),
            Some("stashfailed" | "uploadstash-exception" | "internal_api_error_UploadChunkFileException")
        )
}

impl Site {
    pub fn upload(&mut self, source: UploadSource, options: &UploadOptions) -> Result<UploadOutcome> {
        let filename = options.filename.trim();
        if filename.is_empty() {
            return Err(WikiError::Upload("no target filename given".to_string()));
        }
        self.require_right("upload")?;

        let base = Request::new("upload")
            .set("filename", filename)
            .set("comment", options.comment.as_str())
            .set("text", options.text.clone().unwrap_or_default())
            .set("watchlist", if options.watch { "watch" } else { "" })
            .set_flag("ignorewarnings", options.ignore_warnings == IgnoreWarnings::All);

        let data = match source {
            UploadSource::Url(url) => {
                self.require_right("upload_by_url")?;
                return self.finish_upload(base.set("url", url), options);
            }
            UploadSource::Bytes(data) => data,
            UploadSource::Path(path) => fs::read(&path)?,
        };

        if options.chunk_size == 0 || data.len() <= options.chunk_size {
            let request = base.with_file(FilePart {
                field: "file".to_string(),
                file_name: filename.to_string(),
                bytes: data,
            });
            return self.finish_upload(request, options);
        }

        let filekey = self.upload_chunks(&data, filename, options)?;
        let commit = base.set("filekey", filekey);
        self.finish_upload(commit, options)
    }

    /// Stash `data` chunk by chunk; returns the file key of the assembled file.
    fn upload_chunks(
        &mut self,
        data: &[u8],
        filename: &str,
        options: &UploadOptions,
    ) -> Result<String> {
        let total = data.len();
        let mut offset = 0usize;
        let mut filekey: Option<String> = None;
        let mut retries = 0usize;
        let mut ignore = options.ignore_warnings == IgnoreWarnings::All;

        while offset < total {
            let end = (offset + options.chunk_size).min(total);
            let request = Request::new("upload")
                .set("filename", filename)
                .set("filesize", total.to_string())
                .set_verbatim("offset", offset.to_string())
                .set("stash", "1")
                .set("filekey", filekey.clone().unwrap_or_default())
                .set_flag("ignorewarnings", ignore)
                .with_file(FilePart {
                    field: "chunk".to_string(),
                    file_name: filename.to_string(),
                    bytes: data[offset..end].to_vec(),
                });

            let payload = match self.submit_write(request, TokenKind::Csrf) {
                Ok(payload) => payload,
                Err(error) if retries < options.max_chunk_retries && chunk_retryable(&error) => {
                    retries += 1;
                    tracing::warn!(%error, offset, retries, "chunk failed, retrying");
                    continue;
                }
                Err(error) => return Err(error),
            };
            retries = 0;

            let upload = RawUpload::from_payload(&payload)?;
            if upload.filekey.is_some() {
                filekey = upload.filekey.clone();
            }
            match upload.result.as_deref() {
                Some("Continue") => {
                    let reported = upload
                        .offset
                        .and_then(|offset| usize::try_from(offset).ok())
                        .unwrap_or(end);
                    if reported <= offset {
                        return Err(WikiError::Upload(format!(
                            "server did not advance past offset {offset}"
                        )));
                    }
                    if reported != end {
                        tracing::warn!(expected = end, reported, "resyncing to server offset");
                    }
                    offset = reported;
                }
                Some("Success") => {
                    tracing::debug!(bytes = total, "all chunks stashed");
                    break;
                }
                Some("Warning") => {
                    let codes = upload.warning_codes();
                    if ignore || !options.ignore_warnings.ignores(&codes) {
                        return Err(WikiError::UploadWarning(codes));
                    }
                    tracing::info!(warnings = %codes.join(","), "ignoring upload warnings");
                    ignore = true;
                }
                other => {
                    return Err(WikiError::Upload(format!(
                        "unexpected chunk result {:?} at offset {offset}",
                        other.unwrap_or("none")
                    )));
                }
            }
        }

        filekey.ok_or_else(|| WikiError::Upload("server returned no file key".to_string()))
    }

    fn finish_upload(&mut self, request: Request, options: &UploadOptions) -> Result<UploadOutcome> {
        let mut request = request;
        let mut warnings = Vec::new();
        loop {
            let payload = self.submit_write(request.clone(), TokenKind::Csrf)?;
            let upload = RawUpload::from_payload(&payload)?;
            match upload.result.as_deref() {
                Some("Success") => {
                    let filename = upload
                        .filename
                        .clone()
                        .or_else(|| request.get("filename").map(ToString::to_string))
                        .unwrap_or_default();
                    tracing::info!(file = filename.as_str(), "upload finished");
                    return Ok(UploadOutcome {
                        filename,
                        filekey: upload.filekey,
                        warnings,
                        image_info: upload.imageinfo,
                    });
                }
                Some("Warning") => {
                    let codes = upload.warning_codes();
                    let already_ignoring = request.get("ignorewarnings").is_some();
                    if already_ignoring || !options.ignore_warnings.ignores(&codes) {
                        return Err(WikiError::UploadWarning(codes));
                    }
                    tracing::info!(warnings = %codes.join(","), "ignoring upload warnings");
                    warnings = codes;
                    request = request.set("ignorewarnings", "1");
                    if let Some(filekey) = upload.filekey {
                        request = request.set("filekey", filekey).without_file();
                    }
                }
                other => {
                    return Err(WikiError::Upload(format!(
                        "unexpected upload result {:?}",
                        other.unwrap_or("none")
                    )));
                }
            }
        }
    }

    pub fn file_info(&mut self, title: &Title) -> Result<FileInfo> {
        if title.namespace() != NS_FILE {
            return Err(WikiError::InvalidTitle(format!("{title} is not a file page")));
        }
        let request = Request::query()
            .set("titles", title.full_title())
            .set("prop", "imageinfo")
            .set("iiprop", "url|size|sha1|mime|timestamp|user");
        let pages = QueryGenerator::pages(request, None).collect(self.api_mut())?;
        let page = pages
            .first()
            .ok_or_else(|| WikiError::NoPage(title.full_title()))?;
        let info = page
            .get("imageinfo")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .ok_or_else(|| WikiError::NoPage(title.full_title()))?;
        let raw: RawImageInfo = serde_json::from_value(info.clone())?;
        Ok(FileInfo {
            title: title.full_title(),
            url: raw.url,
            description_url: raw.descriptionurl,
            size: raw.size,
            width: raw.width,
            height: raw.height,
            sha1: raw.sha1,
            mime: raw.mime,
            timestamp: raw.timestamp,
            user: raw.user,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawImageInfo {
    url: Option<String>,
    descriptionurl: Option<String>,
    #[serde(default)]
    size: u64,
    width: Option<u64>,
    height: Option<u64>,
    sha1: Option<String>,
    mime: Option<String>,
    timestamp: Option<String>,
    user: Option<String>,
}

/// Upload every regular file under `dir`, named after the file. One result
/// per file; failures do not stop the run.
pub fn upload_directory(
    site: &mut Site,
    dir: &Path,
    options: &UploadOptions,
) -> Result<Vec<(PathBuf, Result<UploadOutcome>)>> {
    let mut results = Vec::new();
    let walker = WalkDir::new(dir).sort_by_file_name().into_iter();
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            tracing::warn!(path = %path.display(), "skipping file with non-UTF-8 name");
            continue;
        };
        let file_options = UploadOptions {
            filename: name.to_string(),
            ..options.clone()
        };
        let result = site.upload(UploadSource::Path(path.clone()), &file_options);
        if let Err(error) = &result {
            tracing::warn!(path = %path.display(), %error, "upload failed");
        }
        results.push((path, result));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::testing::{MockTransport, mock_site};

    fn uploader() -> Value {
        json!({"query": {"userinfo": {"id": 3, "name": "Bot", "rights": ["upload", "upload_by_url"]}}})
    }

    fn tokens() -> Value {
        json!({"query": {"tokens": {"csrftoken": "t+\\"}}})
    }

    #[test]
    fn chunked_upload_retries_and_resyncs() {
        let transport = MockTransport::new();
        transport.push_json(uploader());
        transport.push_json(tokens());
        transport.push_json(json!({"upload": {"result": "Continue", "offset": 4, "filekey": "k1"}}));
        transport.push_json(json!({"error": {"code": "stashfailed", "info": "storage hiccup"}}));
        transport.push_json(json!({"upload": {"result": "Continue", "offset": 7, "filekey": "k1"}}));
        transport.push_json(json!({"upload": {"result": "Success", "filekey": "k2"}}));
        transport.push_json(json!({"upload": {"result": "Success", "filename": "Test.png",
            "imageinfo": {"size": 10}}}));
        let mut site = mock_site(&transport);
        let options = UploadOptions {
            filename: "Test.png".to_string(),
            comment: "upload".to_string(),
            chunk_size: 4,
            ..UploadOptions::default()
        };
        let outcome = site
            .upload(UploadSource::Bytes(b"0123456789".to_vec()), &options)
            .expect("upload");
        assert_eq!(outcome.filename, "Test.png");

        let first = transport.request(2);
        assert_eq!(first.param("stash"), Some("1"));
        assert_eq!(first.param("offset"), Some("0"));
        assert_eq!(first.param("filesize"), Some("10"));
        assert_eq!(first.param("filekey"), None);
        assert_eq!(first.file.as_ref().map(|file| file.bytes.len()), Some(4));

        let retried = transport.request(4);
        assert_eq!(retried.param("offset"), Some("4"));
        assert_eq!(retried.param("filekey"), Some("k1"));

        let last = transport.request(5);
        assert_eq!(last.param("offset"), Some("7"));
        assert_eq!(last.file.as_ref().map(|file| file.bytes.clone()), Some(b"789".to_vec()));

        let commit = transport.request(6);
        assert_eq!(commit.param("filekey"), Some("k2"));
        assert_eq!(commit.param("stash"), None);
        assert!(commit.file.is_none());
    }

    #[test]
    fn unignored_warnings_abort() {
        let transport = MockTransport::new();
        transport.push_json(uploader());
        transport.push_json(tokens());
        transport.push_json(json!({"upload": {"result": "Warning",
            "warnings": {"exists": "Test.png"}, "filekey": "k"}}));
        let mut site = mock_site(&transport);
        let options = UploadOptions {
            filename: "Test.png".to_string(),
            ..UploadOptions::default()
        };
        let error = site
            .upload(UploadSource::Bytes(b"abc".to_vec()), &options)
            .expect_err("warning");
        assert!(matches!(error, WikiError::UploadWarning(ref codes) if codes == &["exists".to_string()]));
    }

    #[test]
    fn selected_warnings_are_ignored_on_resend() {
        let transport = MockTransport::new();
        transport.push_json(uploader());
        transport.push_json(tokens());
        transport.push_json(json!({"upload": {"result": "Warning",
            "warnings": {"duplicate": ["Other.png"]}, "filekey": "k"}}));
        transport.push_json(json!({"upload": {"result": "Success", "filename": "Test.png"}}));
        let mut site = mock_site(&transport);
        let options = UploadOptions {
            filename: "Test.png".to_string(),
            ignore_warnings: IgnoreWarnings::Only(vec!["duplicate".to_string()]),
            ..UploadOptions::default()
        };
        let outcome = site
            .upload(UploadSource::Bytes(b"abc".to_vec()), &options)
            .expect("upload");
        assert_eq!(outcome.warnings, vec!["duplicate".to_string()]);
        let resend = transport.request(3);
        assert_eq!(resend.param("ignorewarnings"), Some("1"));
        assert_eq!(resend.param("filekey"), Some("k"));
        assert!(resend.file.is_none());
    }

    #[test]
    fn upload_requires_right() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"userinfo": {"id": 0, "name": "1.2.3.4", "anon": true, "rights": ["read"]}}}));
        let mut site = mock_site(&transport);
        let options = UploadOptions {
            filename: "X.png".to_string(),
            ..UploadOptions::default()
        };
        let error = site
            .upload(UploadSource::Bytes(vec![1]), &options)
            .expect_err("denied");
        assert!(matches!(error, WikiError::PermissionDenied(_)));
    }

    #[test]
    fn upload_directory_uploads_each_file() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("a.png"), b"a").expect("write");
        fs::create_dir(temp.path().join("sub")).expect("mkdir");
        fs::write(temp.path().join("sub").join("b.png"), b"b").expect("write");

        let transport = MockTransport::new();
        transport.push_json(uploader());
        transport.push_json(tokens());
        transport.push_json(json!({"upload": {"result": "Success", "filename": "A.png"}}));
        transport.push_json(json!({"upload": {"result": "Failure"}}));
        let mut site = mock_site(&transport);
        let results = upload_directory(&mut site, temp.path(), &UploadOptions::default())
            .expect("walk");
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(WikiError::Upload(_))));
        assert_eq!(transport.request(3).param("filename"), Some("b.png"));
    }

    #[test]
    fn file_info_reads_imageinfo() {
        let transport = MockTransport::new();
        transport.push_json(json!({"query": {"pages": [{"pageid": 9, "ns": 6, "title": "File:Test.png",
            "imageinfo": [{"url": "https://upload.example/Test.png", "size": 10, "width": 2,
                "height": 5, "sha1": "abc", "mime": "image/png", "user": "Bot",
                "timestamp": "2026-01-01T00:00:00Z"}]}]}}));
        let mut site = mock_site(&transport);
        let title = site.parse_title("File:Test.png").expect("title");
        let info = site.file_info(&title).expect("info");
        assert_eq!(info.mime.as_deref(), Some("image/png"));
        assert_eq!(info.size, 10);
    }
}
