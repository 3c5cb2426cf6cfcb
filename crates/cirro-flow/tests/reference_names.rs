//! Property tests for backend parameter names.

use cirro_flow::io_plan::{MAX_REFERENCE_NAME_LEN, safe_reference_name};
use proptest::prelude::*;

fn is_digest(name: &str) -> bool {
    name.len() == 64 && name.chars().all(|c| c.is_ascii_hexdigit())
}

proptest! {
    #[test]
    fn short_names_are_kept(name in "[A-Za-z0-9_./-]{1,127}") {
        prop_assert_eq!(safe_reference_name(&name), name);
    }

    #[test]
    fn long_names_sharing_a_prefix_do_not_collide(
        extra in 1_usize..64,
        tail_a in "[a-z0-9]{1,16}",
        tail_b in "[a-z0-9]{1,16}",
    ) {
        prop_assume!(tail_a != tail_b);
        let prefix = "inputs/".repeat(MAX_REFERENCE_NAME_LEN / 7 + 1) + &"x".repeat(extra);
        let a = format!("{prefix}{tail_a}");
        let b = format!("{prefix}{tail_b}");

        let hashed_a = safe_reference_name(&a);
        let hashed_b = safe_reference_name(&b);
        prop_assert!(is_digest(&hashed_a));
        prop_assert!(is_digest(&hashed_b));
        prop_assert_ne!(hashed_a, hashed_b);
    }
}

#[test]
fn names_differing_only_in_the_last_character_do_not_collide() {
    let base = "a".repeat(MAX_REFERENCE_NAME_LEN);
    let a = format!("{base}1");
    let b = format!("{base}2");

    let hashed_a = safe_reference_name(&a);
    let hashed_b = safe_reference_name(&b);
    assert!(is_digest(&hashed_a) && is_digest(&hashed_b));
    assert_ne!(hashed_a, hashed_b);
    assert_eq!(hashed_a, safe_reference_name(&a));
}
