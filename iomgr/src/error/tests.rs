use super::*;
use anyhow::Result;
use rstest::rstest;
use static_assertions::assert_impl_all;

assert_impl_all!(Error: Send, Sync, Clone, Default, std::error::Error);

fn referenced_count(err: &Error) -> usize {
    err.children().count()
}

#[rstest]
#[case::none(Error::NONE, "\"OK\"")]
#[case::oom(Error::OOM, "\"RESOURCE_EXHAUSTED\"")]
#[case::cancelled(Error::CANCELLED, "\"CANCELLED\"")]
fn test_special_rendering(#[case] err: Error, #[case] expected: &str) -> Result<()> {
    assert!(err.is_special());
    assert_eq!(err.rendered(), expected);
    assert_eq!(err.to_string(), expected);
    Ok(())
}

#[test]
fn test_new_records_location_and_created() -> Result<()> {
    let line = line!() + 1;
    let err = Error::new("boom");

    assert_eq!(err.get_str(StrProperty::Description), Some("boom"));
    assert_eq!(err.get_str(StrProperty::File), Some(file!()));
    assert_eq!(err.get_int(IntProperty::FileLine), Some(i64::from(line)));
    assert!(err.get_time(TimeProperty::Created).is_some());
    assert!(!err.is_special());
    Ok(())
}

#[test]
fn test_rendered_keys_are_sorted() -> Result<()> {
    let err = Error::new("x")
        .set_int(IntProperty::StreamId, 7)
        .set_str(StrProperty::TargetAddress, "ipv4:127.0.0.1:80")
        .set_int(IntProperty::Errno, 2);
    let rendered = err.rendered();

    let keys = ["created", "description", "errno", "file", "file_line", "stream_id", "target_address"];
    let positions: Vec<usize> = keys
        .iter()
        .map(|k| rendered.find(&format!("\"{k}\":")).expect("key rendered"))
        .collect();

    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);
    assert!(rendered.starts_with('{') && rendered.ends_with('}'));
    assert!(rendered.contains("\"stream_id\":7"));
    Ok(())
}

#[rstest]
#[case::first_then_second(true)]
#[case::second_then_first(false)]
fn test_referenced_errors_in_either_order(#[case] first_then_second: bool) -> Result<()> {
    let a = Error::new("a");
    let b = Error::new("b");

    let parent = if first_then_second {
        Error::new("parent").add_child(a).add_child(b)
    } else {
        Error::new("parent").add_child(b).add_child(a)
    };

    assert_eq!(referenced_count(&parent), 2);
    assert_eq!(parent.rendered().matches("\"description\":").count(), 3);
    assert!(parent.rendered().contains("\"referenced_errors\":[{"));
    Ok(())
}

#[test]
fn test_with_children_skips_none() -> Result<()> {
    let err = Error::with_children(
        "composite",
        [Error::NONE, Error::new("one"), Error::NONE, Error::new("two")],
    );

    let descriptions: Vec<_> = err
        .children()
        .map(|c| c.get_str(StrProperty::Description))
        .collect();
    assert_eq!(descriptions, vec![Some("one"), Some("two")]);
    Ok(())
}

#[test]
fn test_status_first_found_in_preorder() -> Result<()> {
    let deep = Error::new("deep")
        .set_int(IntProperty::GrpcStatus, StatusCode::Unavailable.as_i64())
        .set_str(StrProperty::GrpcMessage, "deep message");
    let late = Error::new("late").set_int(IntProperty::GrpcStatus, StatusCode::Internal.as_i64());

    let middle = Error::new("middle").add_child(deep);
    let root = Error::new("root").add_child(middle).add_child(late);

    let (code, message) = root.get_status();
    assert_eq!(code, StatusCode::Unavailable);
    assert_eq!(message, "deep message");
    Ok(())
}

#[test]
fn test_status_root_wins_over_children() -> Result<()> {
    let child = Error::new("child").set_int(IntProperty::GrpcStatus, StatusCode::Internal.as_i64());
    let root = Error::new("root")
        .set_int(IntProperty::GrpcStatus, StatusCode::NotFound.as_i64())
        .add_child(child);

    assert_eq!(root.get_status(), (StatusCode::NotFound, "root".to_string()));
    Ok(())
}

#[test]
fn test_status_unknown_fallback() -> Result<()> {
    let err = Error::new("plain").add_child(Error::new("also plain"));
    assert_eq!(err.get_status(), (StatusCode::Unknown, "plain".to_string()));

    let err = Error::new("bad code").set_int(IntProperty::GrpcStatus, 1234);
    assert_eq!(err.get_status().0, StatusCode::Unknown);
    Ok(())
}

#[rstest]
#[case::none(Error::NONE, StatusCode::Ok, "")]
#[case::oom(Error::OOM, StatusCode::ResourceExhausted, "RESOURCE_EXHAUSTED")]
#[case::cancelled(Error::CANCELLED, StatusCode::Cancelled, "CANCELLED")]
fn test_special_status(
    #[case] err: Error,
    #[case] code: StatusCode,
    #[case] message: &str,
) -> Result<()> {
    assert_eq!(err.get_status(), (code, message.to_string()));
    assert_eq!(err.get_int(IntProperty::GrpcStatus), Some(code.as_i64()));
    assert_eq!(err.get_int(IntProperty::Errno), None);
    Ok(())
}

#[test]
fn test_setters_preserve_shared_version() -> Result<()> {
    let original = Error::new("base").set_int(IntProperty::Offset, 1);
    let shared = original.clone();

    let updated = shared.set_int(IntProperty::Offset, 2).set_str(StrProperty::Key, "k");

    assert_eq!(original.get_int(IntProperty::Offset), Some(1));
    assert_eq!(original.get_str(StrProperty::Key), None);
    assert_eq!(updated.get_int(IntProperty::Offset), Some(2));
    assert_eq!(updated.get_str(StrProperty::Key), Some("k"));
    Ok(())
}

#[test]
fn test_setter_invalidates_rendered_cache() -> Result<()> {
    let err = Error::new("cache");
    let before = err.rendered().to_string();
    assert!(!before.contains("\"size\""));

    let err = err.set_int(IntProperty::Size, 42);
    assert!(err.rendered().contains("\"size\":42"));
    Ok(())
}

#[test]
fn test_add_child_none_rules() -> Result<()> {
    let child = Error::new("child");
    let got = Error::NONE.add_child(child.clone());
    assert!(got.same_as(&child));

    let parent = Error::new("parent");
    let got = parent.clone().add_child(Error::NONE);
    assert!(got.same_as(&parent));
    assert_eq!(referenced_count(&got), 0);

    let got = parent.clone().add_child(parent.clone());
    assert_eq!(referenced_count(&got), 0);
    Ok(())
}

#[test]
fn test_os_error_fields() -> Result<()> {
    let err = Error::os_error(libc::EBADF, "close");

    assert_eq!(err.get_str(StrProperty::Description), Some("OS Error"));
    assert_eq!(err.get_int(IntProperty::Errno), Some(i64::from(libc::EBADF)));
    assert_eq!(err.get_str(StrProperty::Syscall), Some("close"));
    assert!(err.get_str(StrProperty::OsError).is_some_and(|s| !s.is_empty()));
    Ok(())
}

#[test]
fn test_os_error_text_follows_errno() -> Result<()> {
    let text = |errno| Error::os_error(errno, "read").get_str(StrProperty::OsError).map(str::to_owned);

    assert_ne!(text(libc::EBADF), text(libc::EAGAIN));
    // Out-of-range values still render, from several threads at once.
    let handles: Vec<_> = (0..4)
        .map(|_| std::thread::spawn(move || text(100_000)))
        .collect();
    for handle in handles {
        let got = handle.join().map_err(|_| anyhow::anyhow!("render thread panicked"))?;
        assert!(got.is_some_and(|s| !s.is_empty()));
    }
    Ok(())
}

#[rstest]
#[case::none(Error::NONE, "no error", Some(0))]
#[case::oom(Error::OOM, "oom", None)]
#[case::cancelled(Error::CANCELLED, "cancelled", Some(1))]
fn test_setter_materializes_special(
    #[case] err: Error,
    #[case] description: &str,
    #[case] status: Option<i64>,
) -> Result<()> {
    let err = err.set_int(IntProperty::Index, 3);

    assert!(!err.is_special());
    assert_eq!(err.get_str(StrProperty::Description), Some(description));
    assert_eq!(err.get_int(IntProperty::Index), Some(3));
    assert_eq!(err.get_int(IntProperty::GrpcStatus), status);
    Ok(())
}

#[test]
fn test_append_error_builds_composite() -> Result<()> {
    let mut composite = Error::NONE;
    append_error(&mut composite, "many failures", Error::NONE);
    assert!(composite.is_none());

    append_error(&mut composite, "many failures", Error::new("first"));
    append_error(&mut composite, "many failures", Error::new("second"));

    assert_eq!(composite.get_str(StrProperty::Description), Some("many failures"));
    assert_eq!(referenced_count(&composite), 2);
    Ok(())
}

#[test]
fn test_error_shared_across_threads() -> Result<()> {
    let err = Error::new("shared").set_int(IntProperty::Fd, 5);
    let rendered = err.rendered().to_string();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let err = err.clone();
            std::thread::spawn(move || {
                let local = err.clone().set_int(IntProperty::Index, i);
                (err.rendered().to_string(), local.get_int(IntProperty::Index))
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let (seen, index) = handle.join().expect("thread panicked");
        assert_eq!(seen, rendered);
        assert_eq!(index, Some(i as i64));
    }
    Ok(())
}
