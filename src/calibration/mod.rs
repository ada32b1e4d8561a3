//! Camera calibration storage.
//!
//! This module provides the [`CalibrationStore`], which loads and holds the
//! per-camera intrinsic parameters (matrix `K`, distortion `D`, the
//! omnidirectional scalar `xi`, and an optional scale/shift correction) and
//! the extrinsic parameters (position, rotation and the derived 4x4 pose
//! transform) for the four surround-view cameras. The store is populated
//! once at startup and is read-only afterwards, so it can be shared across
//! the concurrent per-camera pipeline tasks without locking.

use log::{info, warn};
use nalgebra::{Matrix3, Matrix4, Rotation3, Vector2, Vector3, Vector4};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use yaml_rust::{Yaml, YamlLoader};

use crate::frame::Rotation;

/// Identifies one of the four surround-view cameras.
///
/// The set is closed: every camera-dependent table (crop geometry, panorama
/// sectors, canonical rotation) is matched exhaustively over this enum, so a
/// camera can never silently fall through a string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Camera {
    Front,
    Left,
    Right,
    Back,
}

impl Camera {
    /// All cameras, in the order the pipeline dispatches them.
    pub const ALL: [Camera; 4] = [Camera::Front, Camera::Left, Camera::Right, Camera::Back];

    pub fn as_str(&self) -> &'static str {
        match self {
            Camera::Front => "front",
            Camera::Left => "left",
            Camera::Right => "right",
            Camera::Back => "back",
        }
    }

    /// Canonical in-plane rotation applied after undistortion.
    ///
    /// This is the single source of truth for per-camera orientation: both
    /// the parallel and the serial pipeline paths, and every composition
    /// mode, consume this value.
    pub fn rotation(&self) -> Rotation {
        match self {
            Camera::Front => Rotation::None,
            Camera::Left => Rotation::Ccw90,
            Camera::Right => Rotation::Cw90,
            Camera::Back => Rotation::Half,
        }
    }
}

impl FromStr for Camera {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(Camera::Front),
            "left" => Ok(Camera::Left),
            "right" => Ok(Camera::Right),
            "back" => Ok(Camera::Back),
            other => Err(CalibrationError::UnknownCamera(other.to_string())),
        }
    }
}

impl std::fmt::Display for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("no calibration file found, tried {0:?}")]
    FileNotFound(Vec<PathBuf>),
    #[error("missing or malformed field '{0}' in calibration file")]
    MissingField(&'static str),
    #[error("invalid calibration value: {0}")]
    InvalidValue(String),
    #[error("unknown camera name: {0}")]
    UnknownCamera(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CalibrationError {
    fn from(err: std::io::Error) -> Self {
        CalibrationError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CalibrationError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CalibrationError::YamlError(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        CalibrationError::CsvError(err.to_string())
    }
}

/// Intrinsic parameters of a single camera.
///
/// `k` is the 3x3 camera matrix, `d` the 4-vector of distortion
/// coefficients. `xi` is the omnidirectional parameter: values above 0.5
/// select the aggressive fisheye undistortion path. `scale` and `shift`
/// are an optional post-crop correction and default to identity/zero.
#[derive(Debug, Clone)]
pub struct CameraIntrinsics {
    pub k: Matrix3<f64>,
    pub d: Vector4<f64>,
    pub xi: f64,
    pub scale: Vector2<f64>,
    pub shift: Vector2<f64>,
}

impl CameraIntrinsics {
    pub fn fx(&self) -> f64 {
        self.k[(0, 0)]
    }

    pub fn fy(&self) -> f64 {
        self.k[(1, 1)]
    }

    pub fn cx(&self) -> f64 {
        self.k[(0, 2)]
    }

    pub fn cy(&self) -> f64 {
        self.k[(1, 2)]
    }

    /// Whether the omnidirectional parameter selects the fisheye path.
    pub fn is_fisheye(&self) -> bool {
        self.xi > 0.5
    }

    /// Whether the scale/shift correction deviates from identity.
    pub fn has_scale_shift(&self) -> bool {
        self.scale.x != 1.0 || self.scale.y != 1.0 || self.shift.x != 0.0 || self.shift.y != 0.0
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.fx() <= 0.0 || self.fy() <= 0.0 {
            return Err(CalibrationError::InvalidValue(
                "focal length must be positive".to_string(),
            ));
        }
        if !self.cx().is_finite() || !self.cy().is_finite() {
            return Err(CalibrationError::InvalidValue(
                "principal point must be finite".to_string(),
            ));
        }
        if self.xi < 0.0 || !self.xi.is_finite() {
            return Err(CalibrationError::InvalidValue(format!(
                "xi must be finite and non-negative, got {}",
                self.xi
            )));
        }
        Ok(())
    }
}

/// Extrinsic pose of a single camera relative to the vehicle reference
/// point.
///
/// `rotation` holds pitch/yaw/roll in degrees as read from the calibration
/// table; `transform` is the derived homogeneous pose, composed in
/// roll * yaw * pitch order with the translation in the last column. The
/// pose is computed once at load time and is immutable thereafter.
#[derive(Debug, Clone)]
pub struct CameraExtrinsics {
    pub position: Vector3<f64>,
    pub rotation: Vector3<f64>,
    pub transform: Matrix4<f64>,
}

impl CameraExtrinsics {
    /// Builds the pose from a position in meters and pitch/yaw/roll in
    /// degrees.
    pub fn from_pose(position: Vector3<f64>, rotation_deg: Vector3<f64>) -> Self {
        let pitch = rotation_deg.x.to_radians();
        let yaw = rotation_deg.y.to_radians();
        let roll = rotation_deg.z.to_radians();

        let r_x = Rotation3::from_axis_angle(&Vector3::x_axis(), pitch);
        let r_y = Rotation3::from_axis_angle(&Vector3::y_axis(), yaw);
        let r_z = Rotation3::from_axis_angle(&Vector3::z_axis(), roll);
        let r = r_z * r_y * r_x;

        let mut transform = Matrix4::identity();
        transform
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(r.matrix());
        transform[(0, 3)] = position.x;
        transform[(1, 3)] = position.y;
        transform[(2, 3)] = position.z;

        CameraExtrinsics {
            position,
            rotation: rotation_deg,
            transform,
        }
    }
}

/// Candidate file locations searched by [`CalibrationStore::load`].
///
/// Mirrors the short relative-path search the deployment uses: the working
/// directory first, then one and two levels up.
#[derive(Debug, Clone)]
pub struct CalibrationPaths {
    pub intrinsics: Vec<PathBuf>,
    pub extrinsics: Vec<PathBuf>,
}

impl Default for CalibrationPaths {
    fn default() -> Self {
        let candidates = |name: &str| {
            vec![
                PathBuf::from(name),
                PathBuf::from("..").join(name),
                PathBuf::from("../..").join(name),
            ]
        };
        CalibrationPaths {
            intrinsics: candidates("camera_intrinsics.yml"),
            extrinsics: candidates("camera_extrinsics.csv"),
        }
    }
}

/// Read-only store of intrinsic and extrinsic parameters for all cameras.
///
/// Constructed once at startup; all accessors take `&self` and no interior
/// mutability exists, so sharing an `Arc<CalibrationStore>` across the
/// per-camera tasks is safe without locks.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    intrinsics: BTreeMap<Camera, CameraIntrinsics>,
    extrinsics: BTreeMap<Camera, CameraExtrinsics>,
}

impl CalibrationStore {
    /// Loads intrinsics for every camera plus the extrinsics table.
    ///
    /// Cameras whose intrinsics cannot be loaded are left absent and a
    /// warning is logged; the pipeline later passes their frames through
    /// uncorrected rather than failing the whole store. A missing
    /// extrinsics table is likewise tolerated (poses default to identity).
    pub fn load(paths: &CalibrationPaths) -> Self {
        let mut store = CalibrationStore::default();

        for camera in Camera::ALL {
            match load_intrinsics(camera, &paths.intrinsics) {
                Ok(params) => {
                    store.intrinsics.insert(camera, params);
                }
                Err(e) => warn!("no intrinsics for camera {camera}: {e}"),
            }
        }

        match load_extrinsics(&paths.extrinsics) {
            Ok(extrinsics) => store.extrinsics = extrinsics,
            Err(e) => warn!("no extrinsics loaded: {e}"),
        }

        store
    }

    /// Builds a store from already-parsed parameters. Used by tests and by
    /// callers that source calibration from somewhere other than files.
    pub fn from_parts(
        intrinsics: BTreeMap<Camera, CameraIntrinsics>,
        extrinsics: BTreeMap<Camera, CameraExtrinsics>,
    ) -> Self {
        CalibrationStore {
            intrinsics,
            extrinsics,
        }
    }

    pub fn intrinsics(&self, camera: Camera) -> Option<&CameraIntrinsics> {
        self.intrinsics.get(&camera)
    }

    /// The 4x4 pose transform for `camera`.
    ///
    /// Returns identity when no extrinsics are known for the camera. That
    /// identity means "no data", not a measured pose at the vehicle origin.
    pub fn extrinsic(&self, camera: Camera) -> Matrix4<f64> {
        self.extrinsics
            .get(&camera)
            .map(|e| e.transform)
            .unwrap_or_else(Matrix4::identity)
    }

    pub fn position(&self, camera: Camera) -> Vector3<f64> {
        self.extrinsics
            .get(&camera)
            .map(|e| e.position)
            .unwrap_or_else(Vector3::zeros)
    }

    pub fn rotation(&self, camera: Camera) -> Vector3<f64> {
        self.extrinsics
            .get(&camera)
            .map(|e| e.rotation)
            .unwrap_or_else(Vector3::zeros)
    }
}

fn yaml_f64(value: &Yaml) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
}

fn yaml_f64_seq(value: &Yaml, field: &'static str) -> Result<Vec<f64>, CalibrationError> {
    let seq = value
        .as_vec()
        .ok_or(CalibrationError::MissingField(field))?;
    seq.iter()
        .map(|v| yaml_f64(v).ok_or(CalibrationError::MissingField(field)))
        .collect()
}

/// Loads intrinsic parameters for one camera from the first readable
/// candidate file.
///
/// The file may carry a per-camera section keyed by the camera name, or a
/// single top-level `K`/`D`/`xi` record that applies to every camera. `K`
/// must be 9 floats (row-major 3x3) and `D` 4 floats; both are mandatory.
/// `xi` is optional and defaults to 0.
pub fn load_intrinsics(
    camera: Camera,
    candidates: &[PathBuf],
) -> Result<CameraIntrinsics, CalibrationError> {
    let path = candidates
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| CalibrationError::FileNotFound(candidates.to_vec()))?;

    info!("loading intrinsics for camera {camera} from {}", path.display());
    let contents = fs::read_to_string(path)?;
    let docs = YamlLoader::load_from_str(&contents)?;
    if docs.is_empty() {
        return Err(CalibrationError::YamlError("empty document".to_string()));
    }
    parse_intrinsics(&docs[0], camera)
}

fn parse_intrinsics(doc: &Yaml, camera: Camera) -> Result<CameraIntrinsics, CalibrationError> {
    // Prefer a per-camera section, fall back to a shared top-level record.
    let section = if doc[camera.as_str()].is_badvalue() {
        doc
    } else {
        &doc[camera.as_str()]
    };

    let k_values = yaml_f64_seq(&section["K"], "K")?;
    if k_values.len() != 9 {
        return Err(CalibrationError::InvalidValue(format!(
            "K must have 9 entries, got {}",
            k_values.len()
        )));
    }
    let d_values = yaml_f64_seq(&section["D"], "D")?;
    if d_values.len() != 4 {
        return Err(CalibrationError::InvalidValue(format!(
            "D must have 4 entries, got {}",
            d_values.len()
        )));
    }

    let xi = yaml_f64(&section["xi"]).unwrap_or(0.0);

    let scale = match yaml_f64_seq(&section["scale"], "scale") {
        Ok(v) if v.len() == 2 => Vector2::new(v[0], v[1]),
        _ => Vector2::new(1.0, 1.0),
    };
    let shift = match yaml_f64_seq(&section["shift"], "shift") {
        Ok(v) if v.len() == 2 => Vector2::new(v[0], v[1]),
        _ => Vector2::zeros(),
    };

    let params = CameraIntrinsics {
        k: Matrix3::from_row_slice(&k_values),
        d: Vector4::new(d_values[0], d_values[1], d_values[2], d_values[3]),
        xi,
        scale,
        shift,
    };
    params.validate()?;
    Ok(params)
}

/// Loads the extrinsic calibration table from the first readable candidate
/// file.
///
/// The table is CSV with a header row and one row per camera: name,
/// position x/y/z in meters, rotation pitch/yaw/roll in degrees. Malformed
/// rows are skipped with a warning; the load only fails when no candidate
/// file can be opened at all.
pub fn load_extrinsics(
    candidates: &[PathBuf],
) -> Result<BTreeMap<Camera, CameraExtrinsics>, CalibrationError> {
    let path = candidates
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| CalibrationError::FileNotFound(candidates.to_vec()))?;

    info!("loading extrinsics from {}", path.display());
    load_extrinsics_file(path)
}

fn load_extrinsics_file(path: &Path) -> Result<BTreeMap<Camera, CameraExtrinsics>, CalibrationError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut extrinsics = BTreeMap::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("skipping malformed extrinsics row: {e}");
                continue;
            }
        };
        match parse_extrinsics_row(&record) {
            Some((camera, pose)) => {
                info!(
                    "loaded extrinsics for camera {camera}: position {:?}, rotation {:?}",
                    pose.position.as_slice(),
                    pose.rotation.as_slice()
                );
                extrinsics.insert(camera, pose);
            }
            None => warn!("skipping malformed extrinsics row: {record:?}"),
        }
    }
    Ok(extrinsics)
}

fn parse_extrinsics_row(record: &csv::StringRecord) -> Option<(Camera, CameraExtrinsics)> {
    if record.len() < 7 {
        return None;
    }
    let camera = record.get(0)?.parse::<Camera>().ok()?;
    let mut values = [0.0f64; 6];
    for (i, value) in values.iter_mut().enumerate() {
        *value = record.get(i + 1)?.parse::<f64>().ok()?;
    }
    let position = Vector3::new(values[0], values[1], values[2]);
    let rotation = Vector3::new(values[3], values[4], values[5]);
    Some((camera, CameraExtrinsics::from_pose(position, rotation)))
}

/// Saves one camera's intrinsics to a YAML file in the shared top-level
/// `K`/`D`/`xi` shape accepted by [`load_intrinsics`].
pub fn save_intrinsics_yaml(
    params: &CameraIntrinsics,
    path: &Path,
) -> Result<(), CalibrationError> {
    let k: Vec<f64> = params.k.transpose().as_slice().to_vec();
    let yaml = serde_yaml::to_value(serde_yaml::Mapping::from_iter([
        (
            serde_yaml::Value::String("K".to_string()),
            serde_yaml::to_value(k).map_err(|e| CalibrationError::YamlError(e.to_string()))?,
        ),
        (
            serde_yaml::Value::String("D".to_string()),
            serde_yaml::to_value(params.d.as_slice().to_vec())
                .map_err(|e| CalibrationError::YamlError(e.to_string()))?,
        ),
        (
            serde_yaml::Value::String("xi".to_string()),
            serde_yaml::to_value(params.xi)
                .map_err(|e| CalibrationError::YamlError(e.to_string()))?,
        ),
    ]))
    .map_err(|e| CalibrationError::YamlError(e.to_string()))?;

    let yaml_string =
        serde_yaml::to_string(&yaml).map_err(|e| CalibrationError::YamlError(e.to_string()))?;

    let mut file = fs::File::create(path).map_err(|e| CalibrationError::IOError(e.to_string()))?;
    file.write_all(yaml_string.as_bytes())
        .map_err(|e| CalibrationError::IOError(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn parse_doc(text: &str) -> Yaml {
        YamlLoader::load_from_str(text).unwrap().remove(0)
    }

    #[test]
    fn test_camera_round_trips_through_names() {
        for camera in Camera::ALL {
            assert_eq!(camera.as_str().parse::<Camera>().unwrap(), camera);
        }
        assert!(matches!(
            "dashcam".parse::<Camera>(),
            Err(CalibrationError::UnknownCamera(_))
        ));
    }

    #[test]
    fn test_parse_shared_intrinsics() {
        let doc = parse_doc(
            "K: [1200.0, 0.0, 960.0, 0.0, 1200.0, 540.0, 0.0, 0.0, 1.0]\n\
             D: [-0.05, 0.01, 0.0, 0.0]\n\
             xi: 1.2\n",
        );
        let params = parse_intrinsics(&doc, Camera::Front).unwrap();
        assert_relative_eq!(params.fx(), 1200.0);
        assert_relative_eq!(params.cy(), 540.0);
        assert_relative_eq!(params.d[0], -0.05);
        assert!(params.is_fisheye());
        assert!(!params.has_scale_shift());
    }

    #[test]
    fn test_parse_per_camera_section_wins() {
        let doc = parse_doc(concat!(
            "K: [100.0, 0.0, 50.0, 0.0, 100.0, 50.0, 0.0, 0.0, 1.0]\n",
            "D: [0.0, 0.0, 0.0, 0.0]\n",
            "left:\n",
            "  K: [800.0, 0.0, 400.0, 0.0, 800.0, 300.0, 0.0, 0.0, 1.0]\n",
            "  D: [-0.1, 0.0, 0.0, 0.0]\n",
            "  xi: 0.2\n",
            "  scale: [1.1, 1.1]\n",
        ));
        let left = parse_intrinsics(&doc, Camera::Left).unwrap();
        assert_relative_eq!(left.fx(), 800.0);
        assert!(!left.is_fisheye());
        assert!(left.has_scale_shift());

        // Cameras without a section fall back to the shared record.
        let front = parse_intrinsics(&doc, Camera::Front).unwrap();
        assert_relative_eq!(front.fx(), 100.0);
        assert_relative_eq!(front.xi, 0.0);
    }

    #[test]
    fn test_missing_k_or_d_is_an_error() {
        let no_d = parse_doc("K: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]\n");
        assert!(matches!(
            parse_intrinsics(&no_d, Camera::Front),
            Err(CalibrationError::MissingField("D"))
        ));

        let short_k = parse_doc("K: [1.0, 2.0]\nD: [0.0, 0.0, 0.0, 0.0]\n");
        assert!(matches!(
            parse_intrinsics(&short_k, Camera::Front),
            Err(CalibrationError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_extrinsic_transform_composition() {
        // Pure yaw of 90 degrees maps +x onto -z.
        let pose = CameraExtrinsics::from_pose(
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(0.0, 90.0, 0.0),
        );
        let x_axis = pose.transform.fixed_view::<3, 1>(0, 0).into_owned();
        assert_relative_eq!(x_axis.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(x_axis.z, -1.0, epsilon = 1e-12);
        assert_relative_eq!(pose.transform[(0, 3)], 1.0);
        assert_relative_eq!(pose.transform[(2, 3)], 3.0);
        assert_relative_eq!(pose.transform[(3, 3)], 1.0);
    }

    #[test]
    fn test_unknown_camera_extrinsic_is_identity() {
        let store = CalibrationStore::default();
        assert_eq!(store.extrinsic(Camera::Back), Matrix4::identity());
        assert_eq!(store.position(Camera::Back), Vector3::zeros());
    }

    #[test]
    fn test_extrinsics_rows_skip_malformed() {
        let dir = std::env::temp_dir().join("surround_view_extrinsics_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("camera_extrinsics.csv");
        fs::write(
            &path,
            "name,pos_x,pos_y,pos_z,rot_pitch,rot_yaw,rot_roll\n\
             front,3.8,0.0,0.6,0.0,0.0,0.0\n\
             left,not_a_number,0.9,0.8,0.0,90.0,0.0\n\
             periscope,0.0,0.0,0.0,0.0,0.0,0.0\n\
             back,-1.0,0.0,0.7,0.0,180.0,0.0\n",
        )
        .unwrap();

        let extrinsics = load_extrinsics_file(&path).unwrap();
        assert_eq!(extrinsics.len(), 2);
        assert!(extrinsics.contains_key(&Camera::Front));
        assert!(extrinsics.contains_key(&Camera::Back));
        assert!(!extrinsics.contains_key(&Camera::Left));
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_intrinsics_save_load_round_trip() {
        let dir = std::env::temp_dir().join("surround_view_intrinsics_test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("camera_intrinsics.yml");
        let params = CameraIntrinsics {
            k: Matrix3::new(950.0, 0.0, 640.0, 0.0, 940.0, 360.0, 0.0, 0.0, 1.0),
            d: Vector4::new(-0.04, 0.01, 0.001, 0.0),
            xi: 1.05,
            scale: Vector2::new(1.0, 1.0),
            shift: Vector2::zeros(),
        };
        save_intrinsics_yaml(&params, &path).unwrap();

        let loaded = load_intrinsics(Camera::Right, &[path.clone()]).unwrap();
        assert_relative_eq!(loaded.fx(), 950.0);
        assert_relative_eq!(loaded.cx(), 640.0);
        assert_relative_eq!(loaded.d[1], 0.01);
        assert_relative_eq!(loaded.xi, 1.05);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_validate_rejects_bad_focal_length() {
        let params = CameraIntrinsics {
            k: Matrix3::new(0.0, 0.0, 10.0, 0.0, 1.0, 10.0, 0.0, 0.0, 1.0),
            d: Vector4::zeros(),
            xi: 0.0,
            scale: Vector2::new(1.0, 1.0),
            shift: Vector2::zeros(),
        };
        assert!(params.validate().is_err());
    }
}
