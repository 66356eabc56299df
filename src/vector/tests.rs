//! Unit tests for Vec3 operations and periodic-boundary helpers.

#[cfg(test)]
mod units {
    use crate::vector::Vec3;


    #[test]
    fn test_arithmetic_operators() {
        let a = Vec3::new(1.0, 2.0, 3.0);
        let b = Vec3::new(4.0, 5.0, 6.0);

        assert_eq!(a + b, Vec3::new(5.0, 7.0, 9.0));
        assert_eq!(b - a, Vec3::new(3.0, 3.0, 3.0));
        assert_eq!(&a + &b, Vec3::new(5.0, 7.0, 9.0));
        assert_eq!(a * 2.0, Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(2.0 * a, Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(b / 2.0, Vec3::new(2.0, 2.5, 3.0));
        assert_eq!(-a, Vec3::new(-1.0, -2.0, -3.0));

        let mut c = a;
        c += b;
        assert_eq!(c, Vec3::new(5.0, 7.0, 9.0));
        c -= b;
        assert_eq!(c, a);
    }

    #[test]
    fn test_norms() {
        let v = Vec3::new(3.0, 4.0, 0.0);
        assert_eq!(v.norm_squared(), 25.0);
        assert_eq!(v.norm(), 5.0);

        let unit = v.normalize();
        assert!((unit.norm() - 1.0).abs() < 1e-15);
        assert_eq!(Vec3::zero().normalize(), Vec3::zero());
    }

    #[test]
    fn test_axis_access() {
        let mut v = Vec3::new(1.0, 2.0, 3.0);
        assert_eq!(v.axis(0), 1.0);
        assert_eq!(v.axis(1), 2.0);
        assert_eq!(v.axis(2), 3.0);

        *v.axis_mut(1) = 7.0;
        assert_eq!(v.y, 7.0);
        assert_eq!(v.to_array(), [1.0, 7.0, 3.0]);
        assert_eq!(Vec3::from_array([1.0, 7.0, 3.0]), v);
    }

    #[test]
    #[should_panic]
    fn test_axis_out_of_range_panics() {
        Vec3::zero().axis(3);
    }

    #[test]
    fn test_wrap_into_box() {
        let box_size = Vec3::splat(1.0);

        let above = Vec3::new(1.25, 0.5, 0.5).wrap(&box_size);
        assert!(above.approx_eq(&Vec3::new(0.25, 0.5, 0.5), 1e-12));

        let below = Vec3::new(-0.25, 0.5, 0.5).wrap(&box_size);
        assert!(below.approx_eq(&Vec3::new(0.75, 0.5, 0.5), 1e-12));

        // A wrapped position is always inside [0, L)
        let exact = Vec3::new(1.0, 0.0, 0.999).wrap(&box_size);
        assert!(exact.x >= 0.0 && exact.x < 1.0);
    }

    #[test]
    fn test_min_image_displacement() {
        let box_size = Vec3::splat(1.0);

        // Particles on opposite faces are close through the boundary
        let a = Vec3::new(0.95, 0.5, 0.5);
        let b = Vec3::new(0.05, 0.5, 0.5);
        let d = (a - b).min_image(&box_size);
        assert!((d.norm() - 0.1).abs() < 1e-12);
        assert!((d.x + 0.1).abs() < 1e-12);

        // Short displacements are unchanged
        let d2 = Vec3::new(0.1, -0.2, 0.3).min_image(&box_size);
        assert!(d2.approx_eq(&Vec3::new(0.1, -0.2, 0.3), 1e-12));
    }

    #[test]
    fn test_max_abs_component() {
        assert_eq!(Vec3::new(-3.0, 2.0, 1.0).max_abs_component(), 3.0);
        assert_eq!(Vec3::zero().max_abs_component(), 0.0);
    }
}
