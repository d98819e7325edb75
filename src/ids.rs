//! Opaque ID generation
//!
//! All engine-level identifiers are URL-safe, prefixed, and ≤64 characters,
//! per spec §6 ("ID formats"): `spc_`, `base_`, `tbl_`, `fld_`, `rec_`,
//! `viw_`, `col_`. IDs are opaque to callers — never parsed for meaning.

use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    // UUID v4 without hyphens keeps the id well under the 64 char cap while
    // staying URL-safe.
    format!("{prefix}{}", Uuid::new_v4().simple())
}

pub fn space_id() -> String {
    prefixed("spc_")
}

pub fn base_id() -> String {
    prefixed("base_")
}

pub fn table_id() -> String {
    prefixed("tbl_")
}

pub fn field_id() -> String {
    prefixed("fld_")
}

pub fn record_id() -> String {
    prefixed("rec_")
}

pub fn view_id() -> String {
    prefixed("viw_")
}

pub fn collaborator_id() -> String {
    prefixed("col_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix_and_stay_under_the_length_cap() {
        assert!(field_id().starts_with("fld_"));
        assert!(record_id().len() <= 64);
        assert!(table_id().len() <= 64);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(record_id(), record_id());
    }
}
