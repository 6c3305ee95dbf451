//! Photo-service methods served over the RPC channel.
//!
//! The handlers only shape requests and responses. The photo data itself
//! comes from a [`PhotoLibrary`], and export destinations are checked
//! against an [`ExportWhitelist`] before the library sees them.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::{
    dispatcher::Dispatcher,
    jsonrpc::{INVALID_PARAMS, NoParams, PERMISSION_DENIED, RpcError, SERVER_ERROR},
    whitelist::{ExportWhitelist, WhitelistError},
};

/// Page size when the caller gives none.
pub const DEFAULT_PAGE: usize = 100;

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "heic", "heif", "gif", "tif", "tiff", "webp", "dng", "raw",
];

/// Photo library failure.
#[derive(Debug, Error)]
pub enum PhotosError {
    #[error("Album not found: {0}")]
    AlbumNotFound(String),
    #[error("Photo not found: {0}")]
    PhotoNotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error(transparent)]
    InvalidPath(#[from] WhitelistError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl PhotosError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        if source.kind() == io::ErrorKind::PermissionDenied {
            return Self::PermissionDenied(context);
        }
        Self::Io { context, source }
    }
}

impl From<PhotosError> for RpcError {
    fn from(err: PhotosError) -> Self {
        let code = match err {
            PhotosError::PermissionDenied(_) => PERMISSION_DENIED,
            PhotosError::InvalidPath(_) => INVALID_PARAMS,
            _ => SERVER_ERROR,
        };
        Self::custom(code, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub count: usize,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Photo {
    pub id: String,
    pub filename: String,
    pub date: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_bytes: u64,
}

/// One page of an album.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoPage {
    pub album_id: String,
    pub album_name: String,
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    pub returned: usize,
    pub photos: Vec<Photo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub photo_id: String,
    pub filename: String,
    pub export_path: String,
    pub success: bool,
}

/// Source of albums and photos. Calls may block.
pub trait PhotoLibrary: Send + Sync {
    /// All albums.
    ///
    /// # Errors
    /// Returns error if the library cannot be read.
    fn albums(&self) -> Result<Vec<Album>, PhotosError>;

    /// An album and every photo in it, in display order.
    ///
    /// # Errors
    /// Returns [`PhotosError::AlbumNotFound`] for unknown ids.
    fn photos(&self, album_id: &str) -> Result<(Album, Vec<Photo>), PhotosError>;

    /// Copy the original of `photo_id` into the directory `dest`.
    ///
    /// # Errors
    /// Returns [`PhotosError::PhotoNotFound`] for unknown ids.
    fn export(&self, photo_id: &str, dest: &Path) -> Result<ExportResult, PhotosError>;
}

/// Library backed by a directory: each subdirectory is an album and each
/// image file inside it is a photo.
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    root: PathBuf,
}

impl DirectoryLibrary {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn album_dir(&self, album_id: &str) -> Result<PathBuf, PhotosError> {
        if !is_plain_name(album_id) {
            return Err(PhotosError::AlbumNotFound(album_id.to_owned()));
        }
        let dir = self.root.join(album_id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(PhotosError::AlbumNotFound(album_id.to_owned()))
        }
    }

    fn image_files(dir: &Path) -> Result<Vec<PathBuf>, PhotosError> {
        let entries = fs::read_dir(dir)
            .map_err(|e| PhotosError::io(format!("failed to read {}", dir.display()), e))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_image(path))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl PhotoLibrary for DirectoryLibrary {
    fn albums(&self) -> Result<Vec<Album>, PhotosError> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            PhotosError::io(format!("failed to read library {}", self.root.display()), e)
        })?;

        let mut albums = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let count = match Self::image_files(&path) {
                Ok(files) => files.len(),
                Err(e) => {
                    tracing::warn!(album = %name, error = %e, "skipping unreadable album");
                    continue;
                }
            };
            albums.push(Album {
                id: name.to_owned(),
                name: name.to_owned(),
                count,
                kind: "album",
            });
        }
        albums.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(albums)
    }

    fn photos(&self, album_id: &str) -> Result<(Album, Vec<Photo>), PhotosError> {
        let dir = self.album_dir(album_id)?;
        let photos: Vec<Photo> = Self::image_files(&dir)?
            .iter()
            .filter_map(|path| photo_from_path(album_id, path))
            .collect();
        let album = Album {
            id: album_id.to_owned(),
            name: album_id.to_owned(),
            count: photos.len(),
            kind: "album",
        };
        Ok((album, photos))
    }

    fn export(&self, photo_id: &str, dest: &Path) -> Result<ExportResult, PhotosError> {
        let not_found = || PhotosError::PhotoNotFound(photo_id.to_owned());
        let (album_id, filename) = photo_id.split_once(':').ok_or_else(not_found)?;
        if !is_plain_name(filename) {
            return Err(not_found());
        }
        let source = self
            .album_dir(album_id)
            .map_err(|_| not_found())?
            .join(filename);
        if !source.is_file() {
            return Err(not_found());
        }

        fs::create_dir_all(dest)
            .map_err(|e| PhotosError::io(format!("failed to create {}", dest.display()), e))?;
        let target = dest.join(filename);
        fs::copy(&source, &target)
            .map_err(|e| PhotosError::io(format!("failed to export {photo_id}"), e))?;
        tracing::info!(photo_id, target = %target.display(), "exported photo");

        Ok(ExportResult {
            photo_id: photo_id.to_owned(),
            filename: filename.to_owned(),
            export_path: target.display().to_string(),
            success: true,
        })
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn photo_from_path(album_id: &str, path: &Path) -> Option<Photo> {
    let filename = path.file_name()?.to_str()?.to_owned();
    let meta = fs::metadata(path).ok()?;
    let date = meta
        .modified()
        .ok()
        .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
    Some(Photo {
        id: format!("{album_id}:{filename}"),
        filename,
        date,
        width: None,
        height: None,
        size_bytes: meta.len(),
    })
}

#[derive(Debug, Deserialize)]
struct GetPhotosArgs {
    album_id: String,
    #[serde(default = "default_page")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

const fn default_page() -> usize {
    DEFAULT_PAGE
}

#[derive(Debug, Deserialize)]
struct ExportArgs {
    photo_id: String,
    export_path: String,
}

async fn blocking<T, F>(f: F) -> Result<T, RpcError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PhotosError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RpcError::Internal(e.to_string()))?;
    result.map_err(|e| {
        tracing::warn!(error = %e, "photo library call failed");
        RpcError::from(e)
    })
}

/// The photo-service method set.
#[derive(Clone)]
pub struct PhotosService {
    library: Arc<dyn PhotoLibrary>,
    whitelist: Arc<ExportWhitelist>,
}

impl std::fmt::Debug for PhotosService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotosService")
            .field("whitelist", &self.whitelist)
            .finish_non_exhaustive()
    }
}

impl PhotosService {
    pub fn new(library: impl PhotoLibrary + 'static, whitelist: ExportWhitelist) -> Self {
        Self {
            library: Arc::new(library),
            whitelist: Arc::new(whitelist),
        }
    }

    /// Register `ping`, `list_albums`, `get_photos` and `export_photo`.
    pub fn register(self, dispatcher: &mut Dispatcher) {
        dispatcher.register_typed("ping", &[], |_: NoParams| async {
            Ok::<_, RpcError>(json!({"status": "ok", "message": "pong"}))
        });

        let library = Arc::clone(&self.library);
        dispatcher.register_typed("list_albums", &[], move |_: NoParams| {
            let library = Arc::clone(&library);
            async move {
                let albums = blocking(move || library.albums()).await?;
                Ok::<_, RpcError>(json!({ "albums": albums }))
            }
        });

        let library = Arc::clone(&self.library);
        dispatcher.register_typed(
            "get_photos",
            &["album_id", "limit", "offset"],
            move |args: GetPhotosArgs| {
                let library = Arc::clone(&library);
                async move {
                    let album_id = args.album_id.clone();
                    let (album, photos) = blocking(move || library.photos(&album_id)).await?;
                    let total_count = photos.len();
                    let page: Vec<Photo> =
                        photos.into_iter().skip(args.offset).take(args.limit).collect();
                    Ok::<_, RpcError>(PhotoPage {
                        album_id: args.album_id,
                        album_name: album.name,
                        total_count,
                        offset: args.offset,
                        limit: args.limit,
                        returned: page.len(),
                        photos: page,
                    })
                }
            },
        );

        let library = self.library;
        let whitelist = self.whitelist;
        dispatcher.register_typed(
            "export_photo",
            &["photo_id", "export_path"],
            move |args: ExportArgs| {
                let library = Arc::clone(&library);
                let whitelist = Arc::clone(&whitelist);
                async move {
                    let exported = blocking(move || {
                        let dest = whitelist.validate(&args.export_path)?;
                        library.export(&args.photo_id, &dest)
                    })
                    .await?;
                    Ok::<_, RpcError>(json!({ "success": true, "data": exported }))
                }
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    struct Fixture {
        library: tempfile::TempDir,
        home: tempfile::TempDir,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let library = tempfile::tempdir().unwrap();
        let trip = library.path().join("Trip");
        fs::create_dir(&trip).unwrap();
        for name in ["c.jpg", "a.JPG", "b.png"] {
            fs::write(trip.join(name), b"pixels").unwrap();
        }
        fs::write(trip.join("notes.txt"), b"not a photo").unwrap();
        fs::create_dir(library.path().join("Empty")).unwrap();
        fs::write(library.path().join("stray.jpg"), b"x").unwrap();

        let home = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new();
        PhotosService::new(
            DirectoryLibrary::new(library.path()),
            ExportWhitelist::for_home(home.path()),
        )
        .register(&mut dispatcher);

        Fixture {
            library,
            home,
            dispatcher,
        }
    }

    async fn call(dispatcher: &Dispatcher, method: &str, params: Value) -> Value {
        let req = json!({"jsonrpc": "2.0", "method": method, "params": params, "id": 1});
        let raw = dispatcher.handle(&serde_json::to_vec(&req).unwrap()).await;
        serde_json::from_slice(&raw).unwrap()
    }

    #[test]
    fn directory_library_lists_albums() {
        let fx = fixture();
        let albums = DirectoryLibrary::new(fx.library.path()).albums().unwrap();
        let summary: Vec<(&str, usize)> = albums.iter().map(|a| (a.name.as_str(), a.count)).collect();
        assert_eq!(summary, vec![("Empty", 0), ("Trip", 3)]);
    }

    #[test]
    fn rejects_escaping_ids() {
        let fx = fixture();
        let lib = DirectoryLibrary::new(fx.library.path());
        assert!(matches!(lib.photos(".."), Err(PhotosError::AlbumNotFound(_))));
        assert!(matches!(
            lib.export("Trip:../stray.jpg", fx.home.path()),
            Err(PhotosError::PhotoNotFound(_))
        ));
        assert!(matches!(
            lib.export("no-separator", fx.home.path()),
            Err(PhotosError::PhotoNotFound(_))
        ));
    }

    #[tokio::test]
    async fn ping_and_list_albums() {
        let fx = fixture();
        let pong = call(&fx.dispatcher, "ping", json!({})).await;
        assert_eq!(pong["result"], json!({"status": "ok", "message": "pong"}));

        let albums = call(&fx.dispatcher, "list_albums", json!([])).await;
        let list = albums["result"]["albums"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["type"], json!("album"));
    }

    #[tokio::test]
    async fn get_photos_pages() {
        let fx = fixture();
        let page = call(&fx.dispatcher, "get_photos", json!({"album_id": "Trip", "limit": 2, "offset": 1})).await;
        let result = &page["result"];
        assert_eq!(result["total_count"], json!(3));
        assert_eq!(result["returned"], json!(2));
        assert_eq!(result["photos"][0]["id"], json!("Trip:b.png"));
        assert!(result["photos"][0]["date"].is_string());

        let defaults = call(&fx.dispatcher, "get_photos", json!(["Trip"])).await;
        assert_eq!(defaults["result"]["limit"], json!(DEFAULT_PAGE));
        assert_eq!(defaults["result"]["offset"], json!(0));

        let missing = call(&fx.dispatcher, "get_photos", json!({"album_id": "Nope"})).await;
        assert_eq!(missing["error"]["code"], json!(SERVER_ERROR));
    }

    #[tokio::test]
    async fn export_respects_whitelist() {
        let fx = fixture();
        let dest = fx.home.path().join("Exports/trip");
        let ok = call(
            &fx.dispatcher,
            "export_photo",
            json!({"photo_id": "Trip:a.JPG", "export_path": dest.to_str().unwrap()}),
        )
        .await;
        assert_eq!(ok["result"]["success"], json!(true));
        assert_eq!(ok["result"]["data"]["filename"], json!("a.JPG"));
        assert!(dest.join("a.JPG").is_file());

        let outside = call(
            &fx.dispatcher,
            "export_photo",
            json!({"photo_id": "Trip:a.JPG", "export_path": "/etc"}),
        )
        .await;
        assert_eq!(outside["error"]["code"], json!(INVALID_PARAMS));
        assert!(
            outside["error"]["message"]
                .as_str()
                .unwrap()
                .contains("outside allowed directories")
        );
    }

    #[test]
    fn permission_errors_use_their_own_code() {
        let err = RpcError::from(PhotosError::PermissionDenied("library".into()));
        assert_eq!(err.code(), PERMISSION_DENIED);
        let err = RpcError::from(PhotosError::PhotoNotFound("x".into()));
        assert_eq!(err.code(), SERVER_ERROR);
    }

    #[test]
    fn rejected_export_path_is_invalid_params() {
        let err = RpcError::from(PhotosError::from(WhitelistError::Traversal));
        assert_eq!(err.code(), INVALID_PARAMS);
        assert_eq!(err.to_string(), WhitelistError::Traversal.to_string());
    }
}
