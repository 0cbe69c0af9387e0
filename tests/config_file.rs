// Configuration file loading and saving

#[cfg(test)]
mod tests {
    use std::io::Write;

    use step_planner::motion::KinematicsType;
    use step_planner::{Config, ConfigError, load_config, save_config};

    const CONFIG: &str = r#"
[planner]
block_buffer_size = 8
acceleration = 1500.0
kinematics = "corexy"
max_extrude_length = 60.0

[axes.x]
steps_per_mm = 100.0
max_feedrate = 250.0
max_acceleration = 2500.0
max_jerk = 8.0

[leveling]
fade_height = 10.0

[leveling.mesh]
origin = [0.0, 0.0]
spacing = [100.0, 100.0]
z = [[0.0, 0.2], [0.2, 0.4]]
"#;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.planner.block_buffer_size, 8);
        assert_eq!(config.planner.acceleration, 1500.0);
        assert_eq!(config.planner.kinematics, KinematicsType::CoreXY);
        assert_eq!(config.planner.max_extrude_length, Some(60.0));
        assert_eq!(config.axes.x.steps_per_mm, 100.0);
        // Unlisted sections keep their defaults.
        assert_eq!(config.axes.y.steps_per_mm, 80.0);
        assert_eq!(config.planner.minimal_step_rate, 120);

        let leveling = config.leveling.unwrap();
        assert!(leveling.enabled);
        assert_eq!(leveling.fade_height, Some(10.0));
        assert_eq!(leveling.mesh.unwrap().z[1][1], 0.4);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("planner.toml");

        let mut config = Config::default();
        config.planner.kinematics = KinematicsType::CoreXZ;
        config.axes.e.steps_per_mm = 415.0;
        save_config(&config, &path).unwrap();

        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_config(dir.path().join("missing.toml")), Err(ConfigError::Io(_))));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[planner\nblock_buffer_size = 8").unwrap();
        assert!(matches!(load_config(&broken), Err(ConfigError::Toml(_))));

        let invalid = dir.path().join("invalid.toml");
        std::fs::write(&invalid, "[planner]\nblock_buffer_size = 1\n").unwrap();
        assert!(matches!(load_config(&invalid), Err(ConfigError::Invalid(_))));
    }
}
