//! Home feed: newest profiles as "fresh faces", everyone else ordered by distance.

use std::cmp::Ordering;

use crate::backend::records::{ProfileRecord, PROFILES_TABLE};
use crate::backend::{decode_rows, Backend, OrderBy, Predicate, Select};
use crate::error::SyncError;
use crate::geo::{distance_km, format_distance, Coordinates};
use crate::identity::short_identity;
use crate::state::NearbyUser;

pub const DEFAULT_FRESH_FACES: usize = 6;

pub fn profiles_by_recency() -> Select {
    Select::from_table(PROFILES_TABLE).order(OrderBy::desc("created_at"))
}

pub fn profile_query(user_id: &str) -> Select {
    Select::from_table(PROFILES_TABLE)
        .filter(Predicate::eq("id", user_id))
        .limit(1)
}

pub async fn fetch_profiles(backend: &dyn Backend) -> Result<Vec<ProfileRecord>, SyncError> {
    Ok(decode_rows(backend.select(profiles_by_recency()).await?)?)
}

pub async fn fetch_profile(
    backend: &dyn Backend,
    user_id: &str,
) -> Result<Option<ProfileRecord>, SyncError> {
    let rows: Vec<ProfileRecord> = decode_rows(backend.select(profile_query(user_id)).await?)?;
    Ok(rows.into_iter().next())
}

fn to_user(p: &ProfileRecord, origin: Option<Coordinates>) -> NearbyUser {
    let distance = distance_km(origin, Coordinates::from_parts(p.latitude, p.longitude));
    NearbyUser {
        id: p.id.clone(),
        username: p.username.clone().unwrap_or_else(|| short_identity(&p.id)),
        avatar_url: p.avatar_url.clone(),
        profile_gif: p.profile_gif.clone(),
        age: p.age,
        online: p.online.unwrap_or(false),
        is_fake: p.is_fake.unwrap_or(false),
        distance_km: distance,
        distance_label: format_distance(distance),
    }
}

/// Split `profiles` (newest first) into fresh faces and the distance-ordered rest.
/// The current user is never listed.
pub fn build_home_feed(
    me: &str,
    origin: Option<Coordinates>,
    profiles: &[ProfileRecord],
    fresh_count: usize,
) -> (Vec<NearbyUser>, Vec<NearbyUser>) {
    let others: Vec<&ProfileRecord> = profiles.iter().filter(|p| p.id != me).collect();
    let split = fresh_count.min(others.len());
    let fresh = others[..split].iter().map(|p| to_user(p, origin)).collect();
    let mut nearby: Vec<NearbyUser> = others[split..].iter().map(|p| to_user(p, origin)).collect();
    // Unknown distances last; ties keep recency order.
    nearby.sort_by(|a, b| match (a.distance_km, b.distance_km) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    (fresh, nearby)
}
