//! Model loading.
//!
//! The [`ModelLoader`] holds at most one loaded detector. Loading a new one discards the previous
//! handle first, so two detectors are never alive at the same time.
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use common::models::DetectorKind;
use futures::future::BoxFuture;
use reqwest::Client;

use crate::{
    nn::{
        BlazeFaceModel, BlazeVariant, CombinedDetector, FaceDetector, UltrafaceModel,
        UltrafaceVariant,
    },
    utils::download_file,
};

/// Loading a detector failed. Fatal for the pipeline, never retried automatically.
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("model asset {} not found and no download URL configured", .0.display())]
    MissingAsset(PathBuf),
    #[error("failed to prepare models directory {}: {source}", .path.display())]
    ModelsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },
    #[error("failed to initialize {kind} backend: {reason}")]
    Backend { kind: DetectorKind, reason: String },
    #[error("loading of {0} was interrupted")]
    Interrupted(DetectorKind),
}

/// Creates detector backends for a given kind.
pub trait DetectorProvider: Send + Sync {
    fn load(
        &self,
        kind: DetectorKind,
    ) -> BoxFuture<'_, Result<Arc<dyn FaceDetector>, ModelLoadError>>;
}

/// Where model files live and where missing ones are fetched from.
#[derive(Clone, Debug)]
pub struct ModelAssets {
    models_dir: PathBuf,
    base_url: Option<String>,
    client: Client,
}

impl ModelAssets {
    pub fn new(models_dir: impl Into<PathBuf>, base_url: Option<String>) -> Self {
        Self {
            models_dir: models_dir.into(),
            base_url,
            client: Client::new(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Path of an asset, downloading it first when it is missing locally.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, ModelLoadError> {
        let path = self.models_dir.join(name);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(path);
        }

        let base_url = match &self.base_url {
            Some(base_url) => base_url,
            None => return Err(ModelLoadError::MissingAsset(path)),
        };

        tokio::fs::create_dir_all(&self.models_dir)
            .await
            .map_err(|source| ModelLoadError::ModelsDir {
                path: self.models_dir.clone(),
                source,
            })?;

        let url = format!("{}/{}", base_url.trim_end_matches('/'), name);
        log::info!("Fetching model asset {} from {}", name, url);
        download_file(&self.client, &url, &path)
            .await
            .map_err(|e| ModelLoadError::Download {
                url,
                reason: format!("{e:#}"),
            })?;

        Ok(path)
    }
}

/// Asset files a detector kind needs, in load order.
pub fn asset_names(kind: DetectorKind) -> Vec<&'static str> {
    match kind {
        DetectorKind::Tiny => vec![UltrafaceVariant::W320H240.asset_name()],
        DetectorKind::SsdMobilenet => vec![UltrafaceVariant::W640H480.asset_name()],
        DetectorKind::BlazeShort => vec![BlazeVariant::ShortRange.asset_name()],
        DetectorKind::BlazeFullRangeSparse => vec![BlazeVariant::FullRangeSparse.asset_name()],
        DetectorKind::TinyBlaze => vec![
            UltrafaceVariant::W320H240.asset_name(),
            BlazeVariant::ShortRange.asset_name(),
        ],
    }
}

/// Builds tract backends from ONNX files.
pub struct OnnxProvider {
    assets: ModelAssets,
}

impl OnnxProvider {
    pub fn new(assets: ModelAssets) -> Self {
        Self { assets }
    }

    async fn load_kind(&self, kind: DetectorKind) -> Result<Arc<dyn FaceDetector>, ModelLoadError> {
        let mut paths = Vec::new();
        for name in asset_names(kind) {
            paths.push(self.assets.resolve(name).await?);
        }

        // Optimizing a graph takes a while, keep it off the async workers
        tokio::task::spawn_blocking(move || build_detector(kind, &paths))
            .await
            .map_err(|_| ModelLoadError::Interrupted(kind))?
    }
}

impl DetectorProvider for OnnxProvider {
    fn load(
        &self,
        kind: DetectorKind,
    ) -> BoxFuture<'_, Result<Arc<dyn FaceDetector>, ModelLoadError>> {
        Box::pin(self.load_kind(kind))
    }
}

fn build_detector(
    kind: DetectorKind,
    paths: &[PathBuf],
) -> Result<Arc<dyn FaceDetector>, ModelLoadError> {
    let backend_err = |e: tract_onnx::prelude::TractError| ModelLoadError::Backend {
        kind,
        reason: format!("{e:#}"),
    };
    let path = |idx: usize| asset_path(paths, idx, kind);

    let detector: Arc<dyn FaceDetector> = match kind {
        DetectorKind::Tiny => Arc::new(
            UltrafaceModel::new(kind, UltrafaceVariant::W320H240, path(0)?).map_err(backend_err)?,
        ),
        DetectorKind::SsdMobilenet => Arc::new(
            UltrafaceModel::new(kind, UltrafaceVariant::W640H480, path(0)?).map_err(backend_err)?,
        ),
        DetectorKind::BlazeShort => Arc::new(
            BlazeFaceModel::new(kind, BlazeVariant::ShortRange, path(0)?, false)
                .map_err(backend_err)?,
        ),
        DetectorKind::BlazeFullRangeSparse => Arc::new(
            BlazeFaceModel::new(kind, BlazeVariant::FullRangeSparse, path(0)?, false)
                .map_err(backend_err)?,
        ),
        DetectorKind::TinyBlaze => {
            let tiny = UltrafaceModel::new(DetectorKind::Tiny, UltrafaceVariant::W320H240, path(0)?)
                .map_err(backend_err)?;
            let blaze = BlazeFaceModel::new(
                DetectorKind::BlazeShort,
                BlazeVariant::ShortRange,
                path(1)?,
                true,
            )
            .map_err(backend_err)?;
            Arc::new(CombinedDetector::new(Box::new(tiny), Box::new(blaze)))
        }
    };

    Ok(detector)
}

fn asset_path(paths: &[PathBuf], idx: usize, kind: DetectorKind) -> Result<&Path, ModelLoadError> {
    paths
        .get(idx)
        .map(PathBuf::as_path)
        .ok_or_else(|| ModelLoadError::Backend {
            kind,
            reason: format!("missing asset #{idx}"),
        })
}

/// Owner of the one active detector handle.
pub struct ModelLoader {
    provider: Arc<dyn DetectorProvider>,
    current: Option<Arc<dyn FaceDetector>>,
}

impl ModelLoader {
    pub fn new(provider: Arc<dyn DetectorProvider>) -> Self {
        Self {
            provider,
            current: None,
        }
    }

    /// Load the detector for `kind`, discarding any previously held handle first.
    pub async fn load(&mut self, kind: DetectorKind) -> Result<Arc<dyn FaceDetector>, ModelLoadError> {
        self.discard();

        log::info!("Loading {} face detection model...", kind);
        let handle = self.provider.load(kind).await?;
        log::info!("{} face detection model loaded.", kind);

        self.current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop the held handle.
    pub fn discard(&mut self) {
        if let Some(handle) = self.current.take() {
            log::debug!("Discarding {} detector", handle.kind());
        }
    }
}
