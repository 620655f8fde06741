use jrt::{
    ConfigError, Runtime, RuntimeError, RuntimeOption,
    runtime::{ClassPathArchive, StatKinds},
};
use std::{fs::File, io::Write, path::Path, sync::Arc};
use zip::{ZipWriter, write::SimpleFileOptions};

fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    for (name, bytes) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

const CLASS_FILE: &[u8] = &[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 50];

#[test]
fn test_empty_boot_class_path_option() {
    let empty = [RuntimeOption::BootClassPath(vec![])];
    assert!(matches!(
        Runtime::new(&empty, false),
        Err(RuntimeError::Config(ConfigError::EmptyBootClassPath))
    ));

    let ignored = [
        RuntimeOption::BootClassPath(vec![]),
        RuntimeOption::from("-Xbootclasspath:"),
    ];
    let runtime = Runtime::new(&ignored, true).unwrap();
    assert!(runtime.class_linker().boot_class_path().is_empty());
    assert!(runtime.find_class("java/lang/Object").unwrap().is_none());
}

#[test]
fn test_find_class_from_pre_opened_archives() {
    let dir = tempfile::tempdir().unwrap();
    let core = dir.path().join("core.jar");
    write_archive(
        &core,
        &[
            ("java/lang/Object.class", CLASS_FILE),
            ("java/lang/Broken.class", b"not a class"),
        ],
    );
    let ext = dir.path().join("ext.jmod");
    write_archive(&ext, &[("classes/java/util/List.class", CLASS_FILE)]);

    let archives = vec![
        Arc::new(ClassPathArchive::open(&core).unwrap()),
        Arc::new(ClassPathArchive::open(&ext).unwrap()),
    ];
    let runtime = Runtime::new(&[RuntimeOption::BootClassPath(archives)], false).unwrap();
    runtime.set_stats_enabled(true);

    let object = runtime.find_class("java/lang/Object").unwrap().unwrap();
    assert_eq!(runtime.find_class("java/lang/Object").unwrap(), Some(object));
    let list = runtime.find_class("java/util/List").unwrap().unwrap();
    assert_ne!(object, list);
    assert_eq!(runtime.find_class("java/lang/Broken").unwrap(), None);
    assert_eq!(runtime.find_class("java/lang/Missing").unwrap(), None);
    assert_eq!(runtime.class_linker().class_count(), 2);
    assert_eq!(runtime.stat(StatKinds::CLASS_INIT_COUNT), 2);

    let mut roots = vec![];
    runtime.visit_concurrent_roots(&mut |root| roots.push(root), Default::default());
    assert_eq!(roots, vec![object, list]);

    assert_eq!(runtime.compile_time_class_path(None).len(), 2);
}

#[test]
fn test_boot_class_path_string_under_host_prefix() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("framework")).unwrap();
    write_archive(
        &dir.path().join("framework/core.jar"),
        &[("java/lang/String.class", CLASS_FILE)],
    );
    let prefix = dir.path().to_str().unwrap().to_string();

    let runtime = Runtime::new(
        &[
            RuntimeOption::HostPrefix(prefix.clone()),
            RuntimeOption::from("-Xbootclasspath:/framework/core.jar:/framework/missing.jar"),
        ],
        false,
    )
    .unwrap();
    assert_eq!(runtime.boot_class_path_string(), "/framework/core.jar:/framework/missing.jar");
    let boot_class_path = runtime.class_linker().boot_class_path();
    assert_eq!(boot_class_path.len(), 1);
    assert_eq!(
        boot_class_path[0].location(),
        Path::new(&runtime.to_host_path("/framework/core.jar"))
    );
    assert_eq!(
        runtime.to_target_path(&boot_class_path[0].location().to_string_lossy()),
        "/framework/core.jar"
    );
    assert!(runtime.find_class("java/lang/String").unwrap().is_some());
}

#[test]
fn test_open_missing_archive_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        ClassPathArchive::open(dir.path().join("absent.jar")),
        Err(RuntimeError::Io(_))
    ));
}
