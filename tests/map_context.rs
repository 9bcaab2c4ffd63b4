use mesh_forest::map::{MAP_QUERY_LAST, MapContext, MapKind, MapQuery, Transform, current_block};
use mesh_forest::mesh_error::MeshForestError;
use serial_test::serial;
use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

fn norm(p: [f64; 3]) -> f64 {
    (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt()
}

#[test]
fn torus_accepts_nested_radii_only() {
    let map = MapContext::torus(2.0, 1.0).unwrap();
    assert!(matches!(map.kind(), MapKind::Torus { .. }));
    assert!(map.query(MapQuery::IsNonlinear));
    let err = MapContext::torus(1.0, 2.0).unwrap_err();
    assert!(matches!(err, MeshForestError::InvalidMapParameter { map: "torus", .. }));
    assert!(!err.is_fatal());
}

#[test]
fn torus_points_lie_on_the_surface() {
    let (r1, r2) = (2.0, 0.5);
    let map = MapContext::torus(r1, r2).unwrap();
    for &(xc, yc) in &[(0.1, 0.2), (0.5, 0.5), (0.9, 0.75)] {
        let p = map.mapc2m(0, xc, yc).unwrap();
        let rho = (p[0] * p[0] + p[1] * p[1]).sqrt();
        let d = ((rho - r1).powi(2) + p[2] * p[2]).sqrt();
        assert!((d - r2).abs() < 1e-12);
    }
}

#[test]
fn spheres_land_on_the_unit_sphere() {
    let pillow = MapContext::pillow_sphere(Transform::default());
    let cubed = MapContext::cubed_sphere(Transform::default());
    for &(xc, yc) in &[(0.25, 0.5), (0.5, 0.5), (0.9, 0.1)] {
        for block in 0..2 {
            assert!((norm(pillow.mapc2m(block, xc, yc).unwrap()) - 1.0).abs() < 1e-12);
        }
        for block in 0..6 {
            assert!((norm(cubed.mapc2m(block, xc, yc).unwrap()) - 1.0).abs() < 1e-12);
        }
    }
    assert_eq!(pillow.expected_blocks(), Some(2));
    assert!(matches!(
        pillow.mapc2m(2, 0.5, 0.5),
        Err(MeshForestError::InvalidBlock { block: 2, num_blocks: 2 })
    ));
}

#[test]
fn transform_scales_then_rotates_then_shifts() {
    let t = Transform::new([2.0, 2.0, 2.0], [1.0, 0.0, 0.0], [0.0, FRAC_PI_2]).unwrap();
    let map = MapContext::cubed_sphere(t);
    let p = map.mapc2m(0, 0.5, 0.5).unwrap();
    let shifted = [p[0] - 1.0, p[1], p[2]];
    assert!((norm(shifted) - 2.0).abs() < 1e-12);
    assert!(Transform::new([1.0, 0.0, 1.0], [0.0; 3], [0.0; 2]).is_err());
}

#[test]
fn query_answers_per_variant() {
    let nomap = MapContext::nomap();
    assert!(!nomap.query(MapQuery::IsUsed));
    assert!(nomap.query(MapQuery::IsAffine));
    let shift = MapContext::scaled_shift([2.0, 3.0], [1.0, 1.0]).unwrap();
    assert!(shift.query(MapQuery::IsScaledShift));
    assert_eq!(shift.mapc2m(0, 0.5, 0.5).unwrap(), [2.0, 2.5, 0.0]);
    for id in [-3, MAP_QUERY_LAST as i32, 99] {
        assert_eq!(shift.query_raw(id), 0);
    }
}

#[test]
#[serial]
fn external_map_sees_its_block() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let map = MapContext::external(
        [1, 0, 0, 1, 1],
        Arc::new(move |xc: f64, yc: f64| {
            record.lock().push(current_block());
            [xc, yc, xc * yc]
        }),
    );
    assert!(map.query(MapQuery::IsGraph));
    assert!(!map.query(MapQuery::IsAffine));
    assert_eq!(map.mapc2m(3, 0.5, 0.25).unwrap(), [0.5, 0.25, 0.125]);
    assert_eq!(map.mapc2m(1, 1.0, 1.0).unwrap(), [1.0, 1.0, 1.0]);
    assert_eq!(*seen.lock(), vec![Some(3), Some(1)]);
    assert_eq!(current_block(), None);
}
