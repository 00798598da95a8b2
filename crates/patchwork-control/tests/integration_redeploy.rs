//! Integration tests for linking overlays and redeploying linked deployments.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::fixtures::{
    main_group, main_one, main_three, other_group, other_two, served_properties, BASE_CONTENT,
    MAIN_DEPLOYMENT, OTHER_DEPLOYMENT, OVERLAY, OVERLAY_CONTENT, PROPERTIES,
};
use common::TestControl;
use patchwork_control::{ErrorKind, Scope};

async fn overlay_with_content(control: &TestControl) {
    control
        .manager
        .add_overlay(OVERLAY)
        .await
        .expect("create failed");
    control
        .manager
        .put_content(OVERLAY, PROPERTIES, Bytes::from_static(OVERLAY_CONTENT))
        .await
        .expect("put failed");
}

#[tokio::test]
async fn group_redeploy_touches_only_that_group() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;

    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");

    let requested = vec![MAIN_DEPLOYMENT.to_owned()];
    let report = control
        .manager
        .redeploy_links(&main_group(), OVERLAY, Some(requested.as_slice()), None)
        .await
        .expect("redeploy failed");

    assert_eq!(report.generation, 1);
    assert!(!report.base_content);
    let locations: Vec<_> = report.completed.iter().map(|c| c.location.clone()).collect();
    assert_eq!(locations, vec![main_one(), main_three()]);

    for location in [main_one(), main_three()] {
        assert_eq!(
            served_properties(&control.executor, &location, MAIN_DEPLOYMENT),
            Bytes::from_static(OVERLAY_CONTENT)
        );
    }
    assert_eq!(
        served_properties(&control.executor, &other_two(), OTHER_DEPLOYMENT),
        Bytes::from_static(BASE_CONTENT)
    );
    assert_eq!(
        control
            .executor
            .redeploy_count(&other_two(), OTHER_DEPLOYMENT)
            .expect("count failed"),
        0
    );
}

#[tokio::test]
async fn domain_redeploy_reaches_every_linked_group() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;

    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");
    control
        .manager
        .add_link(&other_group(), OVERLAY, OTHER_DEPLOYMENT)
        .await
        .expect("link failed");

    let visible = control
        .manager
        .list_links(&Scope::Domain, OVERLAY)
        .expect("list failed");
    assert_eq!(visible.len(), 2);

    let report = control
        .manager
        .redeploy_links(&Scope::Domain, OVERLAY, None, None)
        .await
        .expect("redeploy failed");
    assert_eq!(report.completed.len(), 3);

    assert_eq!(
        served_properties(&control.executor, &other_two(), OTHER_DEPLOYMENT),
        Bytes::from_static(OVERLAY_CONTENT)
    );
}

#[tokio::test]
async fn group_scope_does_not_see_other_groups_links() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;

    control
        .manager
        .add_link(&other_group(), OVERLAY, OTHER_DEPLOYMENT)
        .await
        .expect("link failed");

    assert!(control
        .manager
        .list_links(&main_group(), OVERLAY)
        .expect("list failed")
        .is_empty());

    let requested = vec![OTHER_DEPLOYMENT.to_owned()];
    let err = control
        .manager
        .redeploy_links(&main_group(), OVERLAY, Some(requested.as_slice()), None)
        .await
        .expect_err("redeploy succeeded");
    assert_eq!(err.kind(), ErrorKind::NotLinked);
    assert!(control.executor.applied().expect("log failed").is_empty());
}

#[tokio::test]
async fn unlinked_name_rejects_whole_batch() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;

    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");

    let requested = vec![MAIN_DEPLOYMENT.to_owned(), "not-linked.war".to_owned()];
    let err = control
        .manager
        .redeploy_links(&main_group(), OVERLAY, Some(requested.as_slice()), None)
        .await
        .expect_err("redeploy succeeded");

    assert_eq!(err.kind(), ErrorKind::NotLinked);
    assert!(err.to_string().contains("not-linked.war"), "{err}");
    assert!(control.executor.applied().expect("log failed").is_empty());

    let requested = vec![MAIN_DEPLOYMENT.to_owned()];
    control
        .manager
        .redeploy_links(&main_group(), OVERLAY, Some(requested.as_slice()), None)
        .await
        .expect("redeploy failed");
    for location in [main_one(), main_three()] {
        assert_eq!(
            served_properties(&control.executor, &location, MAIN_DEPLOYMENT),
            Bytes::from_static(OVERLAY_CONTENT)
        );
    }
}

#[tokio::test]
async fn disabled_link_is_skipped_and_rejected() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;

    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");
    control
        .manager
        .set_link_enabled(&main_group(), OVERLAY, MAIN_DEPLOYMENT, false)
        .await
        .expect("disable failed");

    let report = control
        .manager
        .redeploy_links(&main_group(), OVERLAY, None, None)
        .await
        .expect("redeploy failed");
    assert!(report.completed.is_empty());

    let requested = vec![MAIN_DEPLOYMENT.to_owned()];
    let err = control
        .manager
        .redeploy_links(&main_group(), OVERLAY, Some(requested.as_slice()), None)
        .await
        .expect_err("redeploy succeeded");
    assert_eq!(err.kind(), ErrorKind::NotLinked);
}

#[tokio::test]
async fn empty_request_is_a_no_op() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;
    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");

    let report = control
        .manager
        .redeploy_links(&main_group(), OVERLAY, Some(&[][..]), None)
        .await
        .expect("redeploy failed");
    assert!(report.completed.is_empty());
    assert!(control.executor.applied().expect("log failed").is_empty());
}

#[tokio::test]
async fn updated_content_is_applied_with_new_generation() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;
    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");

    control
        .manager
        .redeploy_links(&main_group(), OVERLAY, None, None)
        .await
        .expect("redeploy failed");

    control
        .manager
        .put_content(OVERLAY, PROPERTIES, Bytes::from_static(b"service=is changed"))
        .await
        .expect("put failed");
    let report = control
        .manager
        .redeploy_links(&main_group(), OVERLAY, None, None)
        .await
        .expect("redeploy failed");

    assert_eq!(report.generation, 2);
    assert_eq!(
        served_properties(&control.executor, &main_three(), MAIN_DEPLOYMENT),
        Bytes::from_static(b"service=is changed")
    );
}

#[tokio::test]
async fn removing_link_with_redeploy_restores_base_content() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;
    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");
    control
        .manager
        .redeploy_links(&main_group(), OVERLAY, None, None)
        .await
        .expect("redeploy failed");

    let report = control
        .manager
        .remove_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT, true, None)
        .await
        .expect("remove failed")
        .expect("no report");

    assert!(report.base_content);
    assert_eq!(report.completed.len(), 2);
    for location in [main_one(), main_three()] {
        assert_eq!(
            served_properties(&control.executor, &location, MAIN_DEPLOYMENT),
            Bytes::from_static(BASE_CONTENT)
        );
    }
    assert!(control
        .manager
        .list_links(&main_group(), OVERLAY)
        .expect("list failed")
        .is_empty());
}

#[tokio::test]
async fn removing_link_without_redeploy_leaves_servers_alone() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;
    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");
    control
        .manager
        .redeploy_links(&main_group(), OVERLAY, None, None)
        .await
        .expect("redeploy failed");

    let report = control
        .manager
        .remove_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT, false, None)
        .await
        .expect("remove failed");
    assert!(report.is_none());
    assert_eq!(
        served_properties(&control.executor, &main_one(), MAIN_DEPLOYMENT),
        Bytes::from_static(OVERLAY_CONTENT)
    );
}

#[tokio::test]
async fn slow_location_times_out_without_blocking_others() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;
    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");
    control
        .executor
        .delay_at(&main_three(), Duration::from_secs(10))
        .expect("inject failed");

    let err = control
        .manager
        .redeploy_links(
            &main_group(),
            OVERLAY,
            None,
            Some(Duration::from_millis(50)),
        )
        .await
        .expect_err("redeploy succeeded");

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].location, main_three());
    assert_eq!(
        served_properties(&control.executor, &main_one(), MAIN_DEPLOYMENT),
        Bytes::from_static(OVERLAY_CONTENT)
    );
}

#[tokio::test]
async fn mixed_failures_report_location_failure() {
    let control = TestControl::new().await;
    overlay_with_content(&control).await;
    control
        .manager
        .add_link(&main_group(), OVERLAY, MAIN_DEPLOYMENT)
        .await
        .expect("link failed");
    control
        .executor
        .fail_at(&main_one(), "server restarting")
        .expect("inject failed");
    control
        .executor
        .delay_at(&main_three(), Duration::from_secs(10))
        .expect("inject failed");

    let err = control
        .manager
        .redeploy_links(
            &main_group(),
            OVERLAY,
            None,
            Some(Duration::from_millis(50)),
        )
        .await
        .expect_err("redeploy succeeded");

    assert_eq!(err.kind(), ErrorKind::LocationFailure);
    let failures = err.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|f| f.timed_out));
    assert!(failures.iter().any(|f| !f.timed_out && f.reason.contains("server restarting")));
}

#[tokio::test]
async fn redeploy_of_missing_overlay_is_unknown_overlay() {
    let control = TestControl::new().await;
    let err = control
        .manager
        .redeploy_links(&main_group(), "missing", None, None)
        .await
        .expect_err("redeploy succeeded");
    assert_eq!(err.kind(), ErrorKind::UnknownOverlay);
}
