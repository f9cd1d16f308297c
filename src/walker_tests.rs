#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::ast::{NodeId, NodeKind, WalkState};
    use crate::builder::Builder;
    use crate::compiler::CompileContext;
    use crate::config::CompileOptions;
    use crate::error::{
        CompilerError, ERR_INVALID_NESTING, ERR_TRANSFORM_LOOP, ERR_UNKNOWN_TAG,
        WARN_DEPRECATED_TAG,
    };
    use crate::parse::{HtmlParser, TemplateParser};
    use crate::taglib::{
        exit_transform_fn, transform_fn, Taglib, TaglibEntry, TaglibLookup, TransformResult,
    };
    use crate::walker::Walker;

    fn context(source: &str, taglibs: TaglibLookup) -> (CompileContext, NodeId) {
        let mut builder = Builder::new("views/page.html");
        let root = HtmlParser.parse(source, &mut builder).unwrap();
        let ctx = CompileContext::new(builder, CompileOptions::in_memory(), Arc::new(taglibs));
        (ctx, root)
    }

    fn only(taglib: Taglib) -> TaglibLookup {
        let mut lookup = TaglibLookup::new();
        lookup.register(taglib);
        lookup
    }

    fn first_element(ctx: &CompileContext, parent: NodeId) -> NodeId {
        ctx.builder
            .children(parent)
            .iter()
            .copied()
            .find(|c| ctx.builder.node(*c).tag_name().is_some())
            .unwrap()
    }

    /// Counts how often the `leaf` tag is entered.
    fn counting_leaf(counter: &Arc<AtomicUsize>) -> TaglibEntry {
        let counter = Arc::clone(counter);
        TaglibEntry::new("leaf").transform(transform_fn("count", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TransformResult::Unchanged)
        }))
    }

    #[test]
    fn test_endless_replacement_fails_with_transform_loop() {
        let taglib = Taglib::new("test").entry(TaglibEntry::new("spin").transform(transform_fn(
            "respawn",
            |node, ctx| {
                let location = ctx.builder.node(node).location();
                let fresh = ctx.builder.create_node_at(
                    location,
                    NodeKind::Element {
                        tag: "spin".to_string(),
                    },
                    vec![],
                    vec![],
                )?;
                let parent = ctx.builder.parent(node).unwrap();
                ctx.builder.replace_child(parent, node, fresh)?;
                Ok(TransformResult::Replaced(fresh))
            },
        )));
        let (mut ctx, root) = context("<div><spin></spin></div>", only(taglib));

        let err = Walker::new(3).walk(root, &mut ctx).unwrap_err();
        assert_eq!(err.code(), ERR_TRANSFORM_LOOP);
        assert!(err.to_string().contains("<spin>"), "{}", err);
    }

    #[test]
    fn test_self_expanding_tag_fails_with_transform_loop() {
        // Each pass wraps a fresh <grow> in a fresh <div>, so no node id
        // repeats; created nodes inherit the pass count instead.
        let taglib = Taglib::new("test").entry(TaglibEntry::new("grow").transform(transform_fn(
            "grow",
            |node, ctx| {
                let inner = ctx.builder.create_node(
                    NodeKind::Element {
                        tag: "grow".to_string(),
                    },
                    vec![],
                    vec![],
                )?;
                let wrapper = ctx.builder.create_node(
                    NodeKind::Element {
                        tag: "div".to_string(),
                    },
                    vec![],
                    vec![inner],
                )?;
                let parent = ctx.builder.parent(node).unwrap();
                ctx.builder.replace_child(parent, node, wrapper)?;
                Ok(TransformResult::Replaced(wrapper))
            },
        )));
        let (mut ctx, root) = context("<grow></grow>", only(taglib));

        let err = Walker::default().walk(root, &mut ctx).unwrap_err();
        assert_eq!(err.code(), ERR_TRANSFORM_LOOP);
        assert!(err.to_string().contains("<grow>"), "{}", err);
    }

    #[test]
    fn test_bounded_expansion_chain_settles() {
        // <outer-box> → <middle-box> → <div>: fresh nodes, but it stops.
        let taglib = Taglib::new("test")
            .entry(TaglibEntry::new("outer-box").transform(transform_fn("outer", |node, ctx| {
                let next = ctx.builder.create_node(
                    NodeKind::Element {
                        tag: "middle-box".to_string(),
                    },
                    vec![],
                    vec![],
                )?;
                let parent = ctx.builder.parent(node).unwrap();
                ctx.builder.replace_child(parent, node, next)?;
                Ok(TransformResult::Replaced(next))
            })))
            .entry(TaglibEntry::new("middle-box").transform(transform_fn("middle", |node, ctx| {
                ctx.builder.set_kind(
                    node,
                    NodeKind::Element {
                        tag: "div".to_string(),
                    },
                )?;
                Ok(TransformResult::Changed)
            })));
        let (mut ctx, root) = context("<outer-box></outer-box>", only(taglib));

        Walker::default().walk(root, &mut ctx).unwrap();
        let settled = first_element(&ctx, root);
        assert_eq!(ctx.builder.node(settled).tag_name(), Some("div"));
    }

    #[test]
    fn test_second_walk_applies_nothing() {
        let (mut ctx, root) = context(
            r#"<ul><for each="x in data.items"><li if="x.on">${x.name}</li></for></ul>"#,
            TaglibLookup::with_core(),
        );
        let first = Walker::default().walk(root, &mut ctx).unwrap();
        assert!(first.transforms_applied >= 2);

        let second = Walker::default().walk(root, &mut ctx).unwrap();
        assert_eq!(second.transforms_applied, 0);
    }

    #[test]
    fn test_inserted_sibling_is_visited() {
        let counter = Arc::new(AtomicUsize::new(0));
        let taglib = Taglib::new("test")
            .entry(counting_leaf(&counter))
            .entry(TaglibEntry::new("twin").transform(transform_fn("twin", |node, ctx| {
                let leaf = ctx.builder.create_node(
                    NodeKind::Element {
                        tag: "leaf".to_string(),
                    },
                    vec![],
                    vec![],
                )?;
                let parent = ctx.builder.parent(node).unwrap();
                match ctx.builder.next_sibling(node) {
                    Some(next) => ctx.builder.insert_before(parent, leaf, next)?,
                    None => ctx.builder.append_child(parent, leaf)?,
                }
                ctx.builder.set_kind(
                    node,
                    NodeKind::Element {
                        tag: "div".to_string(),
                    },
                )?;
                Ok(TransformResult::Changed)
            })));
        let (mut ctx, root) = context("<section><twin></twin><p>x</p></section>", only(taglib));

        Walker::default().walk(root, &mut ctx).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let section = first_element(&ctx, root);
        let tags: Vec<&str> = ctx
            .builder
            .children(section)
            .iter()
            .filter_map(|c| ctx.builder.node(*c).tag_name())
            .collect();
        assert_eq!(tags, vec!["div", "leaf", "p"]);
        for child in ctx.builder.children(section) {
            assert_eq!(ctx.builder.node(*child).state(), WalkState::Settled);
        }
    }

    #[test]
    fn test_removed_subtree_is_skipped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let taglib = Taglib::new("test")
            .entry(counting_leaf(&counter))
            .entry(TaglibEntry::new("drop").transform(transform_fn("drop", |node, ctx| {
                ctx.builder.detach(node)?;
                Ok(TransformResult::Removed)
            })));
        let (mut ctx, root) = context(
            "<div><drop><leaf></leaf></drop><leaf></leaf></div>",
            only(taglib),
        );

        Walker::default().walk(root, &mut ctx).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let div = first_element(&ctx, root);
        assert_eq!(ctx.builder.children(div).len(), 1);
    }

    #[test]
    fn test_replacement_is_entered_again() {
        let taglib = Taglib::new("test")
            .entry(TaglibEntry::new("inner-box").renderer("./inner-box.js"))
            .entry(
                TaglibEntry::new("outer-box").transform(transform_fn("expand", |node, ctx| {
                    let inner = ctx.builder.create_node(
                        NodeKind::Element {
                            tag: "inner-box".to_string(),
                        },
                        vec![("title".to_string(), "x".to_string())],
                        vec![],
                    )?;
                    for child in ctx.builder.take_children(node) {
                        ctx.builder.append_child(inner, child)?;
                    }
                    let parent = ctx.builder.parent(node).unwrap();
                    ctx.builder.replace_child(parent, node, inner)?;
                    Ok(TransformResult::Replaced(inner))
                })),
            );
        let (mut ctx, root) = context("<div><outer-box>body</outer-box></div>", only(taglib));

        Walker::default().walk(root, &mut ctx).unwrap();
        let div = first_element(&ctx, root);
        let replaced = ctx.builder.children(div)[0];
        assert_eq!(
            ctx.builder.kind(replaced),
            &NodeKind::CustomTag {
                name: "inner-box".to_string(),
                renderer: "./inner-box.js".to_string(),
            }
        );
        assert_eq!(ctx.builder.children(replaced).len(), 1);
        assert_eq!(ctx.builder.node(replaced).state(), WalkState::Settled);
    }

    #[test]
    fn test_unknown_tag_reports_position() {
        let (mut ctx, root) = context(
            "<div>\n  <fancy-box></fancy-box>\n</div>",
            TaglibLookup::with_core(),
        );
        let err = Walker::default().walk(root, &mut ctx).unwrap_err();
        match err {
            CompilerError::UnknownTag(d) => {
                assert_eq!(d.code, ERR_UNKNOWN_TAG);
                assert_eq!((d.line, d.column), (2, 3));
                assert!(d.message.contains("<fancy-box>"));
            }
            other => panic!("expected unknown tag, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_allowed_becomes_warning() {
        let (mut ctx, root) = context("<fancy-box></fancy-box>", TaglibLookup::with_core());
        ctx.options.allow_unknown_tags = true;
        Walker::default().walk(root, &mut ctx).unwrap();
        assert_eq!(ctx.warnings().count(), 1);
    }

    #[test]
    fn test_deprecation_is_reported_once() {
        let taglib = Taglib::new("test").entry(
            TaglibEntry::new("old-tag")
                .deprecated("use <new-tag> instead")
                .transform(transform_fn("mark", |node, ctx| {
                    if ctx.builder.attribute(node, "seen").is_some() {
                        return Ok(TransformResult::Unchanged);
                    }
                    ctx.builder.set_attribute(node, "seen", "yes")?;
                    Ok(TransformResult::Changed)
                })),
        );
        let (mut ctx, root) = context("<old-tag></old-tag>", only(taglib));

        Walker::default().walk(root, &mut ctx).unwrap();
        let deprecations: Vec<_> = ctx
            .warnings()
            .filter(|d| d.code == WARN_DEPRECATED_TAG)
            .collect();
        assert_eq!(deprecations.len(), 1);
        assert!(deprecations[0].message.contains("<new-tag>"));
    }

    #[test]
    fn test_exit_transform_sees_settled_children() {
        let taglib = Taglib::new("test").entry(TaglibEntry::new("tally").transform(
            exit_transform_fn("tally", |node, ctx| {
                if ctx.builder.attribute(node, "count").is_some() {
                    return Ok(TransformResult::Unchanged);
                }
                let settled = ctx
                    .builder
                    .children(node)
                    .iter()
                    .filter(|c| ctx.builder.node(**c).state() == WalkState::Settled)
                    .count();
                assert_eq!(settled, ctx.builder.children(node).len());
                ctx.builder
                    .set_attribute(node, "count", &settled.to_string())?;
                Ok(TransformResult::Changed)
            }),
        ));
        let (mut ctx, root) = context("<tally><b>1</b><i>2</i></tally>", only(taglib));

        Walker::default().walk(root, &mut ctx).unwrap();
        let tally = first_element(&ctx, root);
        assert_eq!(
            ctx.builder.attribute(tally, "count").unwrap().value.static_value(),
            Some("2".to_string())
        );
    }

    #[test]
    fn test_orphan_else_is_invalid_nesting() {
        let (mut ctx, root) = context("<div><else>x</else></div>", TaglibLookup::with_core());
        let err = Walker::default().walk(root, &mut ctx).unwrap_err();
        assert_eq!(err.code(), ERR_INVALID_NESTING);
    }
}
