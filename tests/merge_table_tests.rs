//! Merge side-table scenarios: identity-routed children and mapped data
//! elements.

use weft::indexer::{DataElementId, IdentificationId, Identity};
use weft::merge::children_by_identity::IdentityUpdate;
use weft::merge::{ChildrenByIdentity, GroupId, MappedDataElements};
use weft::path::PathId;

#[test]
fn update_identity_moves_child_between_buckets() {
    let mut table = ChildrenByIdentity::new();
    let group = GroupId(3);
    table.register_group(group, 0, IdentificationId(0));
    table.add_child(
        Identity::Compressed(7),
        DataElementId(1),
        DataElementId(2),
        group,
    );

    let updates = table.update_identity(
        DataElementId(1),
        &Identity::Compressed(9),
        0,
        IdentificationId(0),
    );
    assert_eq!(
        updates,
        vec![IdentityUpdate {
            child: DataElementId(2),
            group,
            old_identity: Identity::Compressed(7),
        }]
    );
    assert!(table
        .children_of_identity(&Identity::Compressed(7), group)
        .is_none());
    assert!(table
        .children_of_identity(&Identity::Compressed(9), group)
        .is_some_and(|nodes| nodes.contains(&DataElementId(2)) && nodes.len() == 1));
    assert_eq!(
        table.identity_of(DataElementId(2), group),
        Some(&Identity::Compressed(9))
    );
    assert!(table.check_consistency());
}

#[test]
fn children_round_trip_restores_empty_state() {
    let mut table = ChildrenByIdentity::new();
    let g1 = GroupId(1);
    let g2 = GroupId(2);
    table.add_child(Identity::Compressed(1), DataElementId(10), DataElementId(11), g1);
    table.add_child(Identity::Compressed(1), DataElementId(10), DataElementId(12), g1);
    table.add_child(Identity::Compressed(2), DataElementId(10), DataElementId(11), g2);
    assert_eq!(table.num_children(), 2);
    assert!(table.check_consistency());

    table.remove_child(DataElementId(10), DataElementId(11), g1);
    table.remove_child(DataElementId(10), DataElementId(12), g1);
    table.remove_child(DataElementId(10), DataElementId(11), g2);
    assert_eq!(table.num_children(), 0);
    assert!(table.check_consistency());
}

#[test]
fn mapped_elements_full_scenario() {
    let mut mapped = MappedDataElements::new(1000);
    let p1 = PathId(1);
    let p2 = PathId(2);
    let src = DataElementId(5);

    let te1 = mapped.add_target_id(src, p1, None, false);
    let te1_again = mapped.add_target_id(src, p1, None, false);
    assert_eq!(te1, te1_again);

    let dom = mapped.add_target_id(src, p2, Some(DataElementId(10)), true);
    assert_eq!(dom, DataElementId(10));

    mapped.remove_target_id(src, p1, None);
    mapped.remove_target_id(src, p1, None);
    mapped.remove_target_id(src, p2, Some(DataElementId(10)));
    assert!(mapped.is_empty());
}

#[test]
fn mapped_elements_bulk_lookup() {
    let mut mapped = MappedDataElements::new(1000);
    let p = PathId(4);
    let t1 = mapped.add_target_id(DataElementId(1), p, None, false);
    let t2 = mapped.add_target_id(DataElementId(2), p, Some(DataElementId(9)), false);
    assert_ne!(t1, t2);

    let all = mapped.get_all_target_ids_at_path(
        p,
        &[DataElementId(1), DataElementId(2), DataElementId(3)],
        true,
    );
    assert!(all.contains(&t1));
    assert!(all.contains(&t2));
    assert!(all.contains(&DataElementId(3)));
    assert_eq!(all.len(), 3);
}
