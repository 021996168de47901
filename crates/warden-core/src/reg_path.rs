//! Registry key path normalization.
//!
//! Rules are written against stable aliases (`%hklm%`, `%hkcu%`,
//! `currentcontrolset`); kernel object names are rewritten to the same form
//! before matching.

const WOW64_SEGMENTS: [&str; 2] = ["\\wow6432node", "\\wowaa32node"];
const HKLM_PREFIX: &str = "\\registry\\machine\\";
const HKU_PREFIX: &str = "\\registry\\user\\";
const HKLM: &str = "%hklm%\\";
const HKCU: &str = "%hkcu%";
const HKCU_CLASSES: &str = "%hkcu%\\software\\classes";
const CONTROL_SET_PREFIX: &str = "%hklm%\\system\\controlset";
const CURRENT_CONTROL_SET: &str = "%hklm%\\system\\currentcontrolset";
const CLASSES_SUFFIX: &str = "_classes";

pub fn normalize(name: &str) -> String {
    let mut path = name.to_lowercase();

    for segment in WOW64_SEGMENTS {
        let Some(pos) = path.find(segment) else {
            continue;
        };
        let end = pos + segment.len();
        if end < path.len() && path.as_bytes()[end] != b'\\' {
            continue;
        }
        path.replace_range(pos..end, "");
    }

    if let Some(rest) = path.strip_prefix(HKLM_PREFIX) {
        path = format!("{HKLM}{rest}");
        let numbered = CONTROL_SET_PREFIX.len() + 3;
        let bytes = path.as_bytes();
        if path.len() > numbered
            && path.starts_with(CONTROL_SET_PREFIX)
            && bytes[CONTROL_SET_PREFIX.len()..numbered]
                .iter()
                .all(u8::is_ascii_digit)
            && bytes[numbered] == b'\\'
        {
            path.replace_range(..numbered, CURRENT_CONTROL_SET);
        }
    } else if path.starts_with(HKU_PREFIX) {
        if let Some(slash) = path[HKU_PREFIX.len()..].find('\\') {
            let hive_end = HKU_PREFIX.len() + slash;
            let alias = if path[..hive_end].ends_with(CLASSES_SUFFIX) {
                HKCU_CLASSES
            } else {
                HKCU
            };
            path.replace_range(..hive_end, alias);
        }
    }
    path
}

/// Full key path for create/open callbacks.
///
/// A relative name is joined to the root object's name; a name starting with
/// a backslash is already absolute.
pub fn resolve_key_path(root: Option<&str>, complete: Option<&str>) -> Option<String> {
    match complete.filter(|c| !c.is_empty()) {
        None => root.map(str::to_owned),
        Some(c) if c.starts_with('\\') => Some(c.to_owned()),
        Some(c) => match root {
            Some(r) => Some(format!("{r}\\{c}")),
            None => Some(c.to_owned()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_hive_and_control_set_alias() {
        assert_eq!(
            normalize("\\REGISTRY\\MACHINE\\SYSTEM\\ControlSet001\\Services\\EdrDrv"),
            "%hklm%\\system\\currentcontrolset\\services\\edrdrv"
        );
        assert_eq!(
            normalize("\\Registry\\Machine\\Software\\Vendor"),
            "%hklm%\\software\\vendor"
        );
        assert_eq!(
            normalize("\\registry\\machine\\system\\controlset01x\\a"),
            "%hklm%\\system\\controlset01x\\a"
        );
    }

    #[test]
    fn wow64_segment_is_stripped_only_as_whole_segment() {
        assert_eq!(
            normalize("\\registry\\machine\\software\\Wow6432Node\\Vendor"),
            "%hklm%\\software\\vendor"
        );
        assert_eq!(
            normalize("\\registry\\machine\\software\\wow6432node"),
            "%hklm%\\software"
        );
        assert_eq!(
            normalize("\\registry\\machine\\software\\wow6432nodes\\x"),
            "%hklm%\\software\\wow6432nodes\\x"
        );
    }

    #[test]
    fn user_hives_map_to_current_user() {
        assert_eq!(
            normalize("\\REGISTRY\\USER\\S-1-5-21-1-2-3-1001\\Software\\Run"),
            "%hkcu%\\software\\run"
        );
        assert_eq!(
            normalize("\\registry\\user\\s-1-5-21-1-2-3-1001_Classes\\CLSID"),
            "%hkcu%\\software\\classes\\clsid"
        );
        assert_eq!(
            normalize("\\registry\\user\\s-1-5-18"),
            "\\registry\\user\\s-1-5-18"
        );
    }

    #[test]
    fn key_path_resolution() {
        assert_eq!(
            resolve_key_path(Some("\\registry\\machine\\software"), Some("vendor")),
            Some("\\registry\\machine\\software\\vendor".into())
        );
        assert_eq!(
            resolve_key_path(Some("\\root"), Some("\\registry\\machine\\x")),
            Some("\\registry\\machine\\x".into())
        );
        assert_eq!(resolve_key_path(Some("\\root"), None), Some("\\root".into()));
        assert_eq!(resolve_key_path(None, None), None);
    }
}
