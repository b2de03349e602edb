use super::*;

fn path(value: &str) -> ElementPath {
    ElementPath::parse(value).unwrap()
}

async fn make_store() -> BaselineStore {
    BaselineStore::in_memory().await.unwrap()
}

#[tokio::test]
async fn store_and_fetch_element() {
    let store = make_store().await;
    let mut element = DataElement::file(path("/docs/a.txt"), 12, 1_700_000_000_000);
    element.properties = Some(BTreeMap::from([("mime".to_string(), "text/plain".to_string())]));

    store
        .store_element("side_a", &element.path, &element)
        .await
        .unwrap();
    let fetched = store
        .get_element("side_a", &path("/docs/a.txt"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(fetched, element);
    assert_eq!(fetched.path, element.path);
    assert!(
        store
            .get_element("side_b", &path("/docs/a.txt"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn store_overwrites_existing_entry() {
    let store = make_store().await;
    let target = path("/a.txt");
    store
        .store_element("side_a", &target, &DataElement::file(target.clone(), 1, 10))
        .await
        .unwrap();
    store
        .store_element("side_a", &target, &DataElement::folder(target.clone()))
        .await
        .unwrap();

    let fetched = store.get_element("side_a", &target).await.unwrap().unwrap();
    assert!(fetched.is_folder());
    assert_eq!(store.count("side_a").await.unwrap(), 1);
}

#[tokio::test]
async fn oversized_element_is_rejected() {
    let store = make_store().await;
    let target = path("/huge.bin");
    let err = store
        .store_element("side_a", &target, &DataElement::file(target.clone(), u64::MAX, 10))
        .await
        .unwrap_err();

    assert!(matches!(err, BaselineError::SizeOverflow(u64::MAX)));
    assert_eq!(store.count("side_a").await.unwrap(), 0);
}

#[tokio::test]
async fn delete_removes_subtree_but_not_siblings_sharing_a_prefix() {
    let store = make_store().await;
    for value in ["/a", "/a/x.txt", "/a/sub", "/a/sub/y.txt", "/ab", "/ab/z.txt"] {
        let element = DataElement::file(path(value), 1, 1);
        store
            .store_element("side_a", &element.path, &element)
            .await
            .unwrap();
    }

    store.delete_element("side_a", &path("/a")).await.unwrap();

    assert!(store.get_element("side_a", &path("/a")).await.unwrap().is_none());
    assert!(
        store
            .get_element("side_a", &path("/a/sub/y.txt"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(store.get_element("side_a", &path("/ab")).await.unwrap().is_some());
    assert!(
        store
            .get_element("side_a", &path("/ab/z.txt"))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn purge_children_keeps_the_entry_itself() {
    let store = make_store().await;
    for value in ["/d", "/d/1.txt", "/d/2.txt"] {
        let element = DataElement::file(path(value), 1, 1);
        store
            .store_element("side_b", &element.path, &element)
            .await
            .unwrap();
    }

    let purged = store.purge_children("side_b", &path("/d")).await.unwrap();

    assert_eq!(purged, 2);
    assert!(store.get_element("side_b", &path("/d")).await.unwrap().is_some());
    assert_eq!(store.count("side_b").await.unwrap(), 1);
}

#[tokio::test]
async fn child_listing_returns_direct_children_only() {
    let store = make_store().await;
    let entries = [
        DataElement::folder(path("/d")),
        DataElement::file(path("/d/b.txt"), 2, 2),
        DataElement::folder(path("/d/a")),
        DataElement::file(path("/d/a/deep.txt"), 3, 3),
        DataElement::file(path("/top.txt"), 4, 4),
    ];
    for element in &entries {
        store
            .store_element("side_a", &element.path, element)
            .await
            .unwrap();
    }

    let children = store
        .get_child_elements("side_a", &path("/d"))
        .await
        .unwrap();
    let names: Vec<String> = children.iter().map(|e| e.path.to_string()).collect();
    assert_eq!(names, vec!["/d/a", "/d/b.txt"]);

    let roots = store
        .get_child_elements("side_a", &ElementPath::root())
        .await
        .unwrap();
    let names: Vec<String> = roots.iter().map(|e| e.path.to_string()).collect();
    assert_eq!(names, vec!["/d", "/top.txt"]);
}

#[tokio::test]
async fn move_relocates_subtree_across_domains() {
    let store = make_store().await;
    for element in [
        DataElement::folder(path("/src")),
        DataElement::file(path("/src/a.txt"), 5, 50),
        DataElement::file(path("/srcother.txt"), 6, 60),
    ] {
        store
            .store_element("side_a", &element.path, &element)
            .await
            .unwrap();
    }

    let moved = store
        .move_element("side_a", &path("/src"), "side_b", &path("/dst/moved"))
        .await
        .unwrap();

    assert_eq!(moved, 2);
    assert!(store.get_element("side_a", &path("/src")).await.unwrap().is_none());
    let file = store
        .get_element("side_b", &path("/dst/moved/a.txt"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(file, DataElement::file(path("/dst/moved/a.txt"), 5, 50));
    assert!(
        store
            .get_element("side_a", &path("/srcother.txt"))
            .await
            .unwrap()
            .is_some()
    );
    let children = store
        .get_child_elements("side_b", &path("/dst/moved"))
        .await
        .unwrap();
    assert_eq!(children.len(), 1);
}

#[tokio::test]
async fn open_creates_database_file() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("nested").join("baseline.db");
    let store = BaselineStore::open(db_path.clone()).await.unwrap();
    let element = DataElement::file(path("/a.txt"), 1, 1);
    store
        .store_element("side_a", &element.path, &element)
        .await
        .unwrap();

    assert!(db_path.exists());
    store.clear().await.unwrap();
    assert_eq!(store.count("side_a").await.unwrap(), 0);
}
