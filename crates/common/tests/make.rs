//! Integration tests for creating folders and files

mod common;

use ::common::entry::{EntryType, ROOT_ID};
use ::common::internal_fs::{FsError, MakeOptions};
use ::common::tree::{NodeError, TreeError};

#[tokio::test]
async fn test_make_file_creates_missing_folders() {
    let (mut fs, env) = common::setup_test_env().await;

    let id = fs
        .make(MakeOptions::file("/a/b/c.txt", "hello"))
        .await
        .unwrap();

    let graph = fs.tree().graph();
    assert_eq!(graph.path_of(&id).unwrap(), "/a/b/c.txt");
    let a = graph.child_from_path(ROOT_ID, "/a").unwrap();
    assert_eq!(graph.get(a).unwrap().node_type(), EntryType::Dir);
    assert_eq!(fs.cat("/a/b/c.txt", None).await.unwrap(), "hello");

    // three secrets, and exactly one index left on disk
    assert_eq!(env.blobs_of_type('1').await.len(), 2);
    assert_eq!(env.blobs_of_type('2').await.len(), 1);
    assert_eq!(env.blobs_of_type('0').await.len(), 1);
}

#[tokio::test]
async fn test_make_under_existing_folder() {
    let (mut fs, _env) = common::setup_test_env().await;
    fs.make(MakeOptions::dir("/docs")).await.unwrap();
    fs.make(MakeOptions::file("/docs/one", "1")).await.unwrap();
    fs.make(MakeOptions::file("/docs/two", "2")).await.unwrap();

    let docs = fs.tree().graph().child_from_path(ROOT_ID, "/docs").unwrap();
    assert_eq!(fs.tree().graph().get(docs).unwrap().children().len(), 2);
}

#[tokio::test]
async fn test_make_existing_path_fails() {
    let (mut fs, _env) = common::setup_test_env().await;
    fs.make(MakeOptions::file("/a", "x")).await.unwrap();

    let result = fs.make(MakeOptions::file("/a", "y")).await;
    assert!(matches!(
        result,
        Err(FsError::Node(NodeError::EntryExists(_)))
    ));
    assert_eq!(fs.cat("/a", None).await.unwrap(), "x");
}

#[tokio::test]
async fn test_make_under_file_fails() {
    let (mut fs, _env) = common::setup_test_env().await;
    fs.make(MakeOptions::file("/a", "x")).await.unwrap();

    let result = fs.make(MakeOptions::file("/a/b", "y")).await;
    assert!(matches!(
        result,
        Err(FsError::Tree(TreeError::Node(NodeError::NotADirectory(_))))
    ));
}

#[tokio::test]
async fn test_make_relative_to_working_folder() {
    let (mut fs, _env) = common::setup_test_env().await;
    fs.make(MakeOptions::dir("/x")).await.unwrap();
    fs.cd("/x").unwrap();

    let id = fs.make(MakeOptions::file("a/./b/../c", "")).await.unwrap();
    assert_eq!(fs.tree().graph().path_of(&id).unwrap(), "/x/a/c");
}

#[tokio::test]
async fn test_make_folder_ignores_content() {
    let (mut fs, _env) = common::setup_test_env().await;
    let options = MakeOptions {
        path: "/d".to_string(),
        entry_type: EntryType::Dir,
        content: Some("ignored".to_string()),
    };
    let id = fs.make(options).await.unwrap();
    let details = fs.tree().get_entry_details(&id, None).await.unwrap();
    assert_eq!(details.content.as_deref(), Some(""));
}

#[tokio::test]
async fn test_long_name_round_trips_through_overflow() {
    let (mut fs, env) = common::setup_test_env().await;
    let name = "n".repeat(200);
    fs.make(MakeOptions::file(format!("/{}", name), "long"))
        .await
        .unwrap();

    let files = env.blobs_of_type('2').await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].len(), 255);
    assert!(files[0].ends_with('~'));

    let reopened = env.open().await;
    assert_eq!(reopened.cat(&format!("/{}", name), None).await.unwrap(), "long");
    assert!(reopened.tree().alerts().is_empty());
}
