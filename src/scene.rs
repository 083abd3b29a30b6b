// CPU-side scene data
//
// Plain repr(C) structs mirrored by the compute kernel's std430 blocks.
// Explicit padding keeps the Rust layout and the GLSL layout identical;
// every struct is Pod so it can be handed to the engine as raw bytes.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Material {
    pub albedo: Vec3,
    pub metallic: f32,
    pub roughness: f32,
    pub specular: f32,
    pub spec_trans: f32,
    pub ior: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Sphere {
    pub position: Vec3,
    pub _pad0: f32,
    pub color: Vec3,
    pub radius: f32,
    pub material: Material,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Plane {
    pub position: Vec3,
    pub _pad0: f32,
    pub normal: Vec3,
    pub _pad1: f32,
    pub color: Vec3,
    pub _pad2: f32,
    pub material: Material,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SpotLight {
    pub position: Vec3,
    pub radius: f32,
    pub color: Vec3,
    pub intensity: f32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DirectLight {
    pub direction: Vec3,
    pub intensity: f32,
    pub color: Vec3,
    pub _pad0: f32,
}

/// Camera block pushed to the kernel every frame (push constants).
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Camera {
    pub position: Vec4,
    pub forward: Vec4,
    pub up: Vec4,
    pub aspect_ratio: f32,
    pub focal_distance: f32,
    pub samples: i32,
    pub time: f32,
}

impl Camera {
    pub fn new(position: Vec3, aspect_ratio: f32, focal_distance: f32) -> Self {
        Self {
            position: position.extend(1.0),
            forward: Vec4::new(0.0, 0.0, -1.0, 1.0),
            up: Vec4::new(0.0, 1.0, 0.0, 1.0),
            aspect_ratio,
            focal_distance,
            samples: 8,
            time: 0.0,
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        let forward = (target - self.position.truncate()).normalize();
        self.forward = forward.extend(1.0);
    }

    pub fn update_direction(&mut self, yaw_deg: f32, pitch_deg: f32) {
        let yaw = yaw_deg.to_radians();
        let pitch = pitch_deg.to_radians();
        self.forward = Vec4::new(
            yaw.cos() * pitch.cos(),
            pitch.sin(),
            yaw.sin() * pitch.cos(),
            1.0,
        );
    }
}

pub struct Scene {
    pub spheres: Vec<Sphere>,
    pub planes: Vec<Plane>,
    pub spot_lights: Vec<SpotLight>,
    pub direct_lights: Vec<DirectLight>,
}

impl Scene {
    /// The demo scene: a ground plane, two hero spheres, a scattered
    /// field of small ones, one spot light and one directional fill.
    pub fn demo() -> Self {
        let diffuse = Material {
            albedo: Vec3::new(0.2, 0.2, 0.2),
            metallic: 0.1,
            roughness: 0.75,
            specular: 0.0,
            spec_trans: 0.0,
            ior: 0.0,
        };
        let metal = Material {
            albedo: Vec3::new(0.2, 0.2, 0.2),
            metallic: 0.6,
            roughness: 0.8,
            specular: 0.0,
            spec_trans: 0.0,
            ior: 0.0,
        };

        let mut spheres = vec![
            Sphere {
                position: Vec3::new(-0.55, 1.55, -8.0),
                _pad0: 0.0,
                color: Vec3::new(0.0, 0.0, 1.0),
                radius: 1.0,
                material: diffuse,
            },
            Sphere {
                position: Vec3::new(1.3, 1.2, -4.2),
                _pad0: 0.0,
                color: Vec3::ONE,
                radius: 0.8,
                material: metal,
            },
        ];
        spheres.extend(scatter_spheres(16));

        let planes = vec![Plane {
            position: Vec3::new(0.0, -2.0, 0.0),
            _pad0: 0.0,
            normal: Vec3::Y,
            _pad1: 0.0,
            color: Vec3::splat(0.3),
            _pad2: 0.0,
            material: metal,
        }];

        let spot_lights = vec![SpotLight {
            position: Vec3::new(-4.0, 40.0, -3.2),
            radius: 4.0,
            color: Vec3::ONE,
            intensity: 2.0,
        }];

        let direct_lights = vec![DirectLight {
            direction: Vec3::new(0.0, 1.0, 0.0),
            intensity: 0.4,
            color: Vec3::ONE,
            _pad0: 0.0,
        }];

        Self {
            spheres,
            planes,
            spot_lights,
            direct_lights,
        }
    }
}

/// Deterministic sphere field. A tiny LCG keeps the scene reproducible
/// without pulling in a randomness crate.
fn scatter_spheres(count: u32) -> Vec<Sphere> {
    let mut state: u32 = 0x9E37_79B9;
    let mut next = move || {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        (state >> 8) as f32 / (1u32 << 24) as f32
    };

    (0..count)
        .map(|_| {
            let material = Material {
                albedo: Vec3::splat(0.2),
                metallic: next(),
                roughness: next(),
                specular: next() * 0.8,
                spec_trans: 1.0,
                ior: 1.0,
            };
            Sphere {
                position: Vec3::new(next() * 20.0 - 10.0, next() * 2.0, next() * 20.0 - 10.0),
                _pad0: 0.0,
                color: Vec3::new(next(), next(), next()),
                radius: next() + 0.3,
                material,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The kernel's std430 blocks assume these exact sizes
    #[test]
    fn gpu_struct_sizes_match_std430_layout() {
        assert_eq!(std::mem::size_of::<Material>(), 32);
        assert_eq!(std::mem::size_of::<Sphere>(), 64);
        assert_eq!(std::mem::size_of::<Plane>(), 80);
        assert_eq!(std::mem::size_of::<SpotLight>(), 32);
        assert_eq!(std::mem::size_of::<DirectLight>(), 32);
        assert_eq!(std::mem::size_of::<Camera>(), 64);
    }

    #[test]
    fn scatter_is_deterministic() {
        let a = scatter_spheres(4);
        let b = scatter_spheres(4);
        assert_eq!(bytemuck::cast_slice::<_, u8>(&a), bytemuck::cast_slice::<_, u8>(&b));
    }
}
