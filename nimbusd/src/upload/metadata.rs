use thiserror::Error;
use time::OffsetDateTime;

use super::discover::{DiscoveryMode, MediaAsset, MediaKind};
use super::store::{
    Selector, StoreError, TransferInput, TransferRecord, TransferSession, TransferStore,
};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Per-account auto-upload preferences driving naming, routing and
/// destination layout.
#[derive(Debug, Clone)]
pub struct AutoUploadPolicy {
    /// Base remote folder, e.g. "/Photos".
    pub destination: String,
    /// 0 = year, 2 = day, anything else = month.
    pub subfolder_granularity: u8,
    /// Filename mask with `yyyy`, `MM`, `dd`, `HH`, `mm`, `ss` tokens; the
    /// asset's original extension is kept. None keeps the original name.
    pub filename_mask: Option<String>,
    /// Match duplicates against the server-side JPEG a HEIC upload becomes.
    pub jpeg_compat: bool,
    pub wifi_only: bool,
    pub video_wifi_only: bool,
    /// Files above this size upload chunked. 0 disables chunking.
    pub chunk_threshold: u64,
    /// Remote prefixes whose contents are end-to-end encrypted.
    pub encrypted_prefixes: Vec<String>,
}

pub fn masked_file_name(mask: Option<&str>, created: OffsetDateTime, original: &str) -> String {
    let Some(mask) = mask.filter(|mask| !mask.is_empty()) else {
        return original.to_string();
    };
    let mut name = mask
        .replace("yyyy", &format!("{:04}", created.year()))
        .replace("MM", &format!("{:02}", created.month() as u8))
        .replace("dd", &format!("{:02}", created.day()))
        .replace("HH", &format!("{:02}", created.hour()))
        .replace("mm", &format!("{:02}", created.minute()))
        .replace("ss", &format!("{:02}", created.second()));
    if let Some((_, extension)) = original.rsplit_once('.') {
        name.push('.');
        name.push_str(extension);
    }
    name
}

/// Name used for duplicate detection: with JPEG compatibility on, a HEIC
/// asset is matched against the `.jpg` the server-side conversion produces.
pub fn search_file_name(file_name: &str, jpeg_compat: bool) -> String {
    if jpeg_compat
        && let Some((stem, extension)) = file_name.rsplit_once('.')
        && extension.eq_ignore_ascii_case("heic")
    {
        return format!("{stem}.jpg");
    }
    file_name.to_string()
}

pub fn subfolder_path(base: &str, granularity: u8, created: OffsetDateTime) -> String {
    let base = base.trim_end_matches('/');
    match granularity {
        0 => format!("{base}/{:04}", created.year()),
        2 => format!(
            "{base}/{:04}/{:02}/{:02}",
            created.year(),
            created.month() as u8,
            created.day()
        ),
        _ => format!("{base}/{:04}/{:02}", created.year(), created.month() as u8),
    }
}

pub fn route_session(
    selector: Selector,
    kind: MediaKind,
    policy: &AutoUploadPolicy,
) -> TransferSession {
    // Manual "upload all" runs stay on the plain foreground session.
    if selector == Selector::AutoUploadAll {
        return TransferSession::Upload;
    }
    if policy.wifi_only || (kind == MediaKind::Video && policy.video_wifi_only) {
        return TransferSession::UploadBackgroundWifi;
    }
    TransferSession::UploadBackground
}

#[derive(Debug)]
pub enum Planned {
    /// Destination already satisfied; the asset was recorded in the media
    /// index and no record was created.
    Duplicate,
    Created(TransferRecord),
}

/// Turns discovered assets into pending transfer records.
pub struct UploadPlanner {
    store: TransferStore,
    policy: AutoUploadPolicy,
}

impl UploadPlanner {
    pub fn new(store: TransferStore, policy: AutoUploadPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &AutoUploadPolicy {
        &self.policy
    }

    pub async fn plan_asset(
        &self,
        account: &str,
        asset: &MediaAsset,
        selector: Selector,
        mode: DiscoveryMode,
    ) -> Result<Planned, PlanError> {
        let file_name = masked_file_name(
            self.policy.filename_mask.as_deref(),
            asset.created,
            asset.file_name(),
        );
        let search_name = search_file_name(&file_name, self.policy.jpeg_compat);
        let destination = subfolder_path(
            &self.policy.destination,
            self.policy.subfolder_granularity,
            asset.created,
        );

        if self
            .store
            .has_transfer_matching(account, &destination, &search_name)
            .await?
        {
            self.store
                .record_media(account, &asset.asset_id, &asset.created_stamp())
                .await?;
            return Ok(Planned::Duplicate);
        }

        let input = TransferInput {
            account: account.to_string(),
            asset_id: Some(asset.asset_id.clone()),
            server_url: destination.clone(),
            file_name,
            file_name_view: asset.file_name().to_string(),
            local_path: asset.path.to_string_lossy().into_owned(),
            session: route_session(selector, asset.kind, &self.policy),
            selector,
            chunked: self.policy.chunk_threshold > 0 && asset.size > self.policy.chunk_threshold,
            e2e_encrypted: self
                .policy
                .encrypted_prefixes
                .iter()
                .any(|prefix| destination.starts_with(prefix.trim_end_matches('/'))),
            created: asset.created.unix_timestamp(),
        };
        let record = self.store.create_transfer(&input).await?;

        // In the lightweight "new items" mode the index is written as we go;
        // align mode rebuilds it wholesale after discovery.
        if mode == DiscoveryMode::Incremental {
            self.store
                .record_media(account, &asset.asset_id, &asset.created_stamp())
                .await?;
        }
        Ok(Planned::Created(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::store::TransferStatus;
    use crate::upload::store::tests::make_store;
    use std::path::PathBuf;

    // 2024-06-01 12:04:05 UTC
    const CREATED: i64 = 1_717_243_445;

    fn asset(name: &str, kind: MediaKind, size: u64) -> MediaAsset {
        MediaAsset {
            asset_id: format!("DCIM/{name}"),
            path: PathBuf::from(format!("/library/DCIM/{name}")),
            kind,
            created: OffsetDateTime::from_unix_timestamp(CREATED).unwrap(),
            size,
        }
    }

    fn policy() -> AutoUploadPolicy {
        AutoUploadPolicy {
            destination: "/Photos".into(),
            subfolder_granularity: 1,
            filename_mask: None,
            jpeg_compat: true,
            wifi_only: false,
            video_wifi_only: false,
            chunk_threshold: 0,
            encrypted_prefixes: Vec::new(),
        }
    }

    #[test]
    fn subfolder_granularity_year_month_day() {
        let created = OffsetDateTime::from_unix_timestamp(CREATED).unwrap();
        assert_eq!(subfolder_path("/Photos", 0, created), "/Photos/2024");
        assert_eq!(subfolder_path("/Photos", 1, created), "/Photos/2024/06");
        assert_eq!(subfolder_path("/Photos", 2, created), "/Photos/2024/06/01");
        // Any other value falls back to month granularity.
        assert_eq!(subfolder_path("/Photos/", 9, created), "/Photos/2024/06");
    }

    #[test]
    fn mask_expands_date_tokens_and_keeps_extension() {
        let created = OffsetDateTime::from_unix_timestamp(CREATED).unwrap();
        assert_eq!(
            masked_file_name(Some("IMG_yyyyMMdd_HHmmss"), created, "raw.HEIC"),
            "IMG_20240601_120405.HEIC"
        );
        assert_eq!(masked_file_name(None, created, "raw.heic"), "raw.heic");
        assert_eq!(masked_file_name(Some(""), created, "raw.heic"), "raw.heic");
    }

    #[test]
    fn search_name_substitutes_heic_for_jpg() {
        assert_eq!(search_file_name("photo.heic", true), "photo.jpg");
        assert_eq!(search_file_name("photo.HEIC", true), "photo.jpg");
        assert_eq!(search_file_name("photo.heic", false), "photo.heic");
        assert_eq!(search_file_name("photo.png", true), "photo.png");
    }

    #[test]
    fn session_routing() {
        let mut policy = policy();
        assert_eq!(
            route_session(Selector::AutoUploadAll, MediaKind::Image, &policy),
            TransferSession::Upload
        );
        assert_eq!(
            route_session(Selector::AutoUpload, MediaKind::Image, &policy),
            TransferSession::UploadBackground
        );

        policy.video_wifi_only = true;
        assert_eq!(
            route_session(Selector::AutoUpload, MediaKind::Video, &policy),
            TransferSession::UploadBackgroundWifi
        );
        assert_eq!(
            route_session(Selector::AutoUpload, MediaKind::Image, &policy),
            TransferSession::UploadBackground
        );

        policy.wifi_only = true;
        assert_eq!(
            route_session(Selector::AutoUpload, MediaKind::Image, &policy),
            TransferSession::UploadBackgroundWifi
        );
    }

    #[tokio::test]
    async fn plan_creates_pending_record_and_indexes_asset() {
        let store = make_store().await;
        let planner = UploadPlanner::new(store.clone(), policy());
        let asset = asset("a.jpg", MediaKind::Image, 1000);

        let planned = planner
            .plan_asset("acct", &asset, Selector::AutoUpload, DiscoveryMode::Incremental)
            .await
            .unwrap();

        let Planned::Created(record) = planned else {
            panic!("expected a created record");
        };
        assert_eq!(record.status, TransferStatus::WaitUpload);
        assert_eq!(record.server_url, "/Photos/2024/06");
        assert_eq!(record.file_name, "a.jpg");
        assert_eq!(record.session, TransferSession::UploadBackground);
        assert_eq!(record.created, CREATED);
        assert!(!record.chunked);
        assert!(!record.e2e_encrypted);
        assert!(
            store
                .media_contains("acct", "DCIM/a.jpg", &asset.created_stamp())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn heic_matching_existing_view_name_is_a_duplicate() {
        let store = make_store().await;
        let planner = UploadPlanner::new(store.clone(), policy());

        // Server already holds the converted JPEG under the same destination.
        let mut existing = crate::upload::store::tests::sample_input("photo_server.jpg", 1);
        existing.file_name_view = "photo.jpg".into();
        store.create_transfer(&existing).await.unwrap();

        let asset = asset("photo.heic", MediaKind::Image, 1000);
        let planned = planner
            .plan_asset("acct", &asset, Selector::AutoUpload, DiscoveryMode::Incremental)
            .await
            .unwrap();

        assert!(matches!(planned, Planned::Duplicate));
        // Recorded as satisfied, so discovery will not offer it again.
        assert!(
            store
                .media_contains("acct", "DCIM/photo.heic", &asset.created_stamp())
                .await
                .unwrap()
        );
        // Only the pre-existing record remains.
        assert_eq!(store.count_waiting("acct").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn chunked_and_encrypted_flags_follow_policy() {
        let store = make_store().await;
        let mut policy = policy();
        policy.chunk_threshold = 500;
        policy.encrypted_prefixes = vec!["/Photos".into()];
        let planner = UploadPlanner::new(store, policy);

        let big = asset("big.mp4", MediaKind::Video, 5_000);
        let Planned::Created(record) = planner
            .plan_asset("acct", &big, Selector::AutoUpload, DiscoveryMode::Incremental)
            .await
            .unwrap()
        else {
            panic!("expected a created record");
        };
        assert!(record.chunked);
        assert!(record.e2e_encrypted);
    }

    #[tokio::test]
    async fn align_mode_does_not_write_index_entries() {
        let store = make_store().await;
        let planner = UploadPlanner::new(store.clone(), policy());
        let asset = asset("a.jpg", MediaKind::Image, 10);

        planner
            .plan_asset("acct", &asset, Selector::AutoUploadAll, DiscoveryMode::Align)
            .await
            .unwrap();
        assert!(
            !store
                .media_contains("acct", "DCIM/a.jpg", &asset.created_stamp())
                .await
                .unwrap()
        );
    }
}
