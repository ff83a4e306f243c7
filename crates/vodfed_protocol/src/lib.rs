/*
 * SPDX-FileCopyrightText: 2026 Vodfed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types exchanged between federated instances: the activity envelope,
//! the stats query response, and the external rights policy enumeration.

use serde::{Deserialize, Serialize};

/// A federation activity: one state change originated by `actor` (an instance
/// origin URL), identified by a globally unique id. The payload is immutable
/// once committed; receivers deduplicate on `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub id: String,
    pub actor: String,
    #[serde(flatten)]
    pub payload: ActivityPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ActivityPayload {
    VideoCreated { video: VideoObject },
    CommentCreated { comment: CommentObject },
    VideoViewed { view: ViewObject },
    FollowRequested { follower: String, following: String },
    FollowAccepted { follower: String, following: String },
    FollowRejected { follower: String, following: String },
}

impl ActivityPayload {
    /// Stable type tag, used as the `type` column in the activity store.
    pub fn kind(&self) -> &'static str {
        match self {
            ActivityPayload::VideoCreated { .. } => "VideoCreated",
            ActivityPayload::CommentCreated { .. } => "CommentCreated",
            ActivityPayload::VideoViewed { .. } => "VideoViewed",
            ActivityPayload::FollowRequested { .. } => "FollowRequested",
            ActivityPayload::FollowAccepted { .. } => "FollowAccepted",
            ActivityPayload::FollowRejected { .. } => "FollowRejected",
        }
    }
}

/// A video as it travels over the wire. `(uuid, origin)` is the global
/// identity; `size_bytes` is the stored file size reported by the owning
/// instance's storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoObject {
    pub uuid: String,
    pub origin: String,
    pub name: String,
    pub size_bytes: i64,
    pub published_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentObject {
    pub uuid: String,
    pub origin: String,
    pub video_uuid: String,
    pub video_origin: String,
    pub text: String,
    pub published_ms: i64,
}

/// One watch event. `viewer` is an opaque key (client address or similar)
/// used only for coalescing repeated views of the same video.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewObject {
    pub video_uuid: String,
    pub video_origin: String,
    pub viewer: String,
}

/// Snapshot of local and federated counters, computed from a single
/// consistent read. Field names match the public stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_local_videos: u64,
    pub total_videos: u64,
    pub total_local_video_comments: u64,
    pub total_video_comments: u64,
    pub total_local_video_views: u64,
    pub total_local_video_files_size: u64,
    pub total_users: u64,
    pub total_instance_followers: u64,
    pub total_instance_following: u64,
}

/// Rights policy input. Owned by the external auth collaborator; the engine
/// only consumes it as a capability check before mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRight {
    All,
    ManageUsers,
    ManageServerFollow,
    ManageServerRedundancy,
    ManageVideoAbuses,
    ManageJobs,
    ManageConfiguration,
    ManageAccountsBlocklist,
    ManageServersBlocklist,
    ManageVideoBlacklist,
    ManageVideoQuarantine,
    BypassVideoQuarantine,
    RemoveAnyVideo,
    RemoveAnyVideoChannel,
    RemoveAnyVideoComment,
    UpdateAnyVideo,
    SeeAllVideos,
    ChangeVideoOwnership,
}
