//! Typed value conversions for directive handlers.

use crate::error::{Error, Result};

/// Parse a boolean directive value. `YES`/`NO` are the documented forms;
/// `TRUE`/`FALSE` and `1`/`0` are accepted as well.
pub fn parse_bool(val: &str) -> Result<bool> {
    match val.trim().to_ascii_uppercase().as_str() {
        "YES" | "TRUE" | "1" => Ok(true),
        "NO" | "FALSE" | "0" => Ok(false),
        other => Err(Error::InvalidInput(format!(
            "expected a boolean (YES/NO), got: {other}"
        ))),
    }
}

pub fn parse_u16(val: &str) -> Result<u16> {
    val.trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("expected a 16-bit unsigned integer: {val}")))
}

pub fn parse_u64(val: &str) -> Result<u64> {
    val.trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("expected a 64-bit unsigned integer: {val}")))
}

pub fn parse_i64(val: &str) -> Result<i64> {
    val.trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("expected a 64-bit signed integer: {val}")))
}

/// Resolve a `USER` value to a numeric uid at parse time. Numeric values are
/// taken as-is; names go through the system name service. The resolved
/// account name is cached alongside the id when available.
pub fn resolve_user(val: &str) -> Result<(libc::uid_t, Option<String>)> {
    let val = val.trim();
    if val.is_empty() {
        return Err(Error::InvalidInput("empty USER value".into()));
    }
    if let Ok(uid) = val.parse::<libc::uid_t>() {
        let name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name);
        return Ok((uid, name));
    }
    match nix::unistd::User::from_name(val) {
        Ok(Some(user)) => Ok((user.uid.as_raw(), Some(user.name))),
        Ok(None) => Err(Error::NotFound(format!("no such user: {val}"))),
        Err(e) => Err(Error::os(format!("resolving user {val}"), e)),
    }
}

fn resolve_one_group(val: &str) -> Result<(libc::gid_t, Option<String>)> {
    if let Ok(gid) = val.parse::<libc::gid_t>() {
        let name = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name);
        return Ok((gid, name));
    }
    match nix::unistd::Group::from_name(val) {
        Ok(Some(group)) => Ok((group.gid.as_raw(), Some(group.name))),
        Ok(None) => Err(Error::NotFound(format!("no such group: {val}"))),
        Err(e) => Err(Error::os(format!("resolving group {val}"), e)),
    }
}

/// Resolve a `GROUP` value: `primary[,supplementary…]`, each numeric or a
/// name. Returns the primary gid (with cached name) and the supplementary
/// gids.
pub fn resolve_group_list(
    val: &str,
) -> Result<((libc::gid_t, Option<String>), Vec<libc::gid_t>)> {
    let mut parts = val.split(',').map(str::trim);
    let primary = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::InvalidInput("empty GROUP value".into()))?;
    let primary = resolve_one_group(primary)?;
    let mut sup = Vec::new();
    for part in parts {
        if part.is_empty() {
            return Err(Error::InvalidInput(format!(
                "empty supplementary group in GROUP value: {val}"
            )));
        }
        sup.push(resolve_one_group(part)?.0);
    }
    Ok((primary, sup))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booleans() {
        assert!(parse_bool("YES").unwrap());
        assert!(parse_bool("yes").unwrap());
        assert!(parse_bool("1").unwrap());
        assert!(!parse_bool("NO").unwrap());
        assert!(!parse_bool("false").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn integers() {
        assert_eq!(parse_u16("54321").unwrap(), 54321);
        assert!(parse_u16("70000").is_err());
        assert_eq!(parse_u64(" 100000 ").unwrap(), 100_000);
        assert_eq!(parse_i64("-1").unwrap(), -1);
        assert!(parse_i64("x").is_err());
    }

    #[test]
    fn numeric_user_and_group_resolve_without_nss() {
        // uid 0 exists everywhere; the numeric path must not require a
        // passwd entry for arbitrary ids though.
        let (uid, _) = resolve_user("0").unwrap();
        assert_eq!(uid, 0);
        let (uid, name) = resolve_user("987654").unwrap();
        assert_eq!(uid, 987654);
        assert_eq!(name, None);

        let ((gid, _), sup) = resolve_group_list("0").unwrap();
        assert_eq!(gid, 0);
        assert!(sup.is_empty());

        let ((gid, _), sup) = resolve_group_list("0,987654,987655").unwrap();
        assert_eq!(gid, 0);
        assert_eq!(sup, vec![987654, 987655]);
    }

    #[test]
    fn unknown_names_are_not_found() {
        assert!(resolve_user("no-such-user-xyzzy").is_err());
        assert!(resolve_group_list("no-such-group-xyzzy").is_err());
        assert!(resolve_group_list("0,,1").is_err());
        assert!(resolve_user("").is_err());
    }
}
