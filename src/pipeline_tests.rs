#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::sync::Arc;

    use crate::cache::HASH_HEADER;
    use crate::codegen::{AttributeValue, Fragment};
    use crate::error::{
        ERR_INVALID_ATTRIBUTE, ERR_INVALID_NODE_KIND, ERR_UNKNOWN_TAG, WARN_DEPRECATED_TAG,
    };
    use crate::parse::{HtmlParser, TemplateParser};
    use crate::{
        check_up_to_date, compile, compile_file, compile_file_async, compile_files,
        create_builder, create_walker, generate_code, CompileContext, CompileOptions, Compiler,
        PreserveWhitespace, Taglib, TaglibEntry, TaglibLookup,
    };

    fn options() -> CompileOptions {
        CompileOptions::in_memory()
    }

    fn compiled(source: &str) -> crate::CodeUnit {
        compile(source, "views/page.html", &options()).unwrap()
    }

    /// Minimal fragment interpreter: writes are looked up by name and loop
    /// sources must be JSON string arrays.
    fn render(fragments: &[Fragment], scope: &mut HashMap<String, String>, out: &mut String) {
        for fragment in fragments {
            match fragment {
                Fragment::Element { tag, children, .. } => {
                    out.push_str(&format!("<{}>", tag));
                    render(children, scope, out);
                    out.push_str(&format!("</{}>", tag));
                }
                Fragment::Text { value, .. } => out.push_str(value),
                Fragment::Write { code, .. } => out.push_str(&scope[code.as_str()]),
                Fragment::Loop {
                    item, source, body, ..
                } => {
                    let values: Vec<String> = serde_json::from_str(source).unwrap();
                    for value in values {
                        scope.insert(item.clone(), value);
                        render(body, scope, out);
                    }
                    scope.remove(item);
                }
                other => panic!("unexpected fragment {:?}", other),
            }
        }
    }

    fn first_branching(fragments: &[Fragment]) -> Option<&Fragment> {
        fragments.iter().find_map(|f| match f {
            Fragment::Branching { .. } => Some(f),
            Fragment::Element { children, .. } => first_branching(children),
            Fragment::Loop { body, .. } => first_branching(body),
            _ => None,
        })
    }

    fn branch_tests(fragment: &Fragment) -> Vec<Option<String>> {
        match fragment {
            Fragment::Branching { branches } => branches.iter().map(|b| b.test.clone()).collect(),
            other => panic!("expected branching, got {:?}", other),
        }
    }

    #[test]
    fn test_static_element() {
        let unit = compiled("<div>Hello</div>");
        assert_eq!(
            unit.fragments,
            vec![Fragment::Element {
                tag: "div".to_string(),
                attributes: vec![],
                children: vec![Fragment::Text {
                    value: "Hello".to_string(),
                    escape: true,
                }],
            }]
        );
        assert!(unit.code.contains(r#"out.w("<div>Hello</div>");"#));
        assert!(unit.code.starts_with("module.exports = function create(__helpers) {"));
        assert!(unit.warnings.is_empty());
        assert!(!unit.from_cache);
    }

    #[test]
    fn test_loop_renders_items_in_order() {
        let unit = compiled(r#"<for each='color in ["red","green","blue"]'><li>${color}</li></for>"#);

        let mut out = String::new();
        render(&unit.fragments, &mut HashMap::new(), &mut out);
        assert_eq!(out, "<li>red</li><li>green</li><li>blue</li>");
        assert!(unit.code.contains(
            r#"for (color_list = (["red","green","blue"]) || [], color_index = 0; color_index < color_list.length; color_index++) {"#
        ));
        assert!(unit.code.contains("color = color_list[color_index];"));
        assert!(unit.code.contains("out.w(escapeXml(color));"));
    }

    #[test]
    fn test_escaped_and_raw_writes() {
        let unit = compiled("<p>${data.name} $!{data.html}</p>");
        assert!(unit.code.contains("out.w(escapeXml(data.name));"));
        assert!(unit.code.contains("out.w(str(data.html));"));
    }

    #[test]
    fn test_preserved_tags_keep_whitespace() {
        let options =
            CompileOptions::from_json(r#"{"preserveWhitespace": {"pre": true}, "writeToDisk": false}"#)
                .unwrap();
        let unit = compile(
            "<pre>  a   b  </pre><div>  a   b  </div>",
            "views/page.html",
            &options,
        )
        .unwrap();
        assert!(unit.code.contains("<pre>  a   b  </pre><div> a b </div>"));
    }

    #[test]
    fn test_output_is_deterministic() {
        let source = r#"<ul>
  <li for="(item, i) in data.items" if="item.visible">${i}: ${item.name}</li>
</ul>
<if test="data.a">A<else>B</else></if>"#;
        assert_eq!(compiled(source).code, compiled(source).code);
    }

    #[test]
    fn test_sibling_else_chain() {
        let unit = compiled(
            "<if test=\"data.a\"><p>A</p></if>\n<else-if test=\"data.b\"><p>B</p></else-if>\n<else><p>C</p></else>",
        );
        assert_eq!(unit.fragments.len(), 1);
        assert_eq!(
            branch_tests(&unit.fragments[0]),
            vec![Some("data.a".to_string()), Some("data.b".to_string()), None]
        );
        assert!(unit.code.contains("if (data.a) {"));
        assert!(unit.code.contains("} else if (data.b) {"));
        assert!(unit.code.contains("} else {"));
    }

    #[test]
    fn test_nested_else_branch() {
        let unit = compiled(r#"<if test="data.a">A<else>B</else></if>"#);
        let branching = first_branching(&unit.fragments).unwrap();
        assert_eq!(
            branch_tests(branching),
            vec![Some("data.a".to_string()), None]
        );
    }

    #[test]
    fn test_attribute_directives_wrap_for_outermost() {
        let unit = compiled(
            r#"<ul><li for="item in data.items" if="item.visible">${item.name}</li></ul><label for="email">Email</label>"#,
        );
        let body = match &unit.fragments[0] {
            Fragment::Element { children, .. } => children,
            other => panic!("expected <ul>, got {:?}", other),
        };
        match &body[0] {
            Fragment::Loop { item, source, body, .. } => {
                assert_eq!(item, "item");
                assert_eq!(source, "data.items");
                assert_eq!(
                    branch_tests(&body[0]),
                    vec![Some("item.visible".to_string())]
                );
            }
            other => panic!("expected loop, got {:?}", other),
        }

        match &unit.fragments[1] {
            Fragment::Element { tag, attributes, .. } => {
                assert_eq!(tag, "label");
                assert_eq!(attributes[0].name, "for");
                assert_eq!(
                    attributes[0].value,
                    AttributeValue::Static {
                        value: "email".to_string()
                    }
                );
            }
            other => panic!("expected <label>, got {:?}", other),
        }
    }

    #[test]
    fn test_for_tag_filters_items_with_if() {
        let unit = compiled(r#"<for each="x in data.xs" if="x.ok"><li>${x.name}</li></for>"#);
        match &unit.fragments[0] {
            Fragment::Loop { item, body, .. } => {
                assert_eq!(item, "x");
                assert_eq!(body.len(), 1);
                assert_eq!(branch_tests(&body[0]), vec![Some("x.ok".to_string())]);
            }
            other => panic!("expected loop, got {:?}", other),
        }
        assert!(unit.code.contains("if (x.ok) {"));
    }

    #[test]
    fn test_if_tag_with_for_repeats_the_chain() {
        let unit = compiled(r#"<if test="x.on" for="x in data.xs">${x.name}<else>-</else></if>"#);
        assert_eq!(unit.fragments.len(), 1);
        match &unit.fragments[0] {
            Fragment::Loop { source, body, .. } => {
                assert_eq!(source, "data.xs");
                assert_eq!(
                    branch_tests(&body[0]),
                    vec![Some("x.on".to_string()), None]
                );
            }
            other => panic!("expected loop, got {:?}", other),
        }
    }

    #[test]
    fn test_control_tags_reject_stray_attributes() {
        for source in [
            r#"<for each="x in data.xs" class="row">${x}</for>"#,
            r#"<if test="data.a" id="main">A</if>"#,
            r#"<if test="data.a">A</if><else test="data.b">B</else>"#,
        ] {
            let err = compile(source, "views/page.html", &options()).unwrap_err();
            assert_eq!(err.error.code(), ERR_INVALID_ATTRIBUTE, "{}", source);
        }
    }

    #[test]
    fn test_html_comment_emits_markup() {
        let unit = compiled("<div><html-comment>note</html-comment></div>");
        assert!(unit.code.contains("<div><!--note--></div>"), "{}", unit.code);
    }

    #[test]
    fn test_html_comment_cannot_close_itself_early() {
        let err = compile(
            "<html-comment> a --> b </html-comment>",
            "views/page.html",
            &options(),
        )
        .unwrap_err();
        assert_eq!(err.error.code(), ERR_INVALID_NODE_KIND);
    }

    #[test]
    fn test_legacy_tag_warns() {
        let unit = compiled(r#"<c-if test="data.ok">yes</c-if>"#);
        assert_eq!(unit.warnings.len(), 1);
        assert_eq!(unit.warnings[0].code, WARN_DEPRECATED_TAG);
        assert!(first_branching(&unit.fragments).is_some());
    }

    #[test]
    fn test_custom_tag_calls_hoisted_handler() {
        let mut taglibs = TaglibLookup::with_core();
        taglibs.register(
            Taglib::new("ui").entry(TaglibEntry::new("fancy-card").renderer("./fancy-card")),
        );
        let compiler = Compiler::new(options()).with_taglibs(Arc::new(taglibs));
        let unit = compiler
            .compile(
                r#"<fancy-card title="${data.title}">Body</fancy-card><fancy-card></fancy-card>"#,
                "views/page.html",
            )
            .unwrap();

        assert_eq!(unit.hoisted.len(), 1);
        assert!(unit
            .code
            .contains(r#"var fancy_card_tag = loadTag(require("./fancy-card"));"#));
        assert!(unit.code.contains(r#""title": data.title,"#));
        assert!(unit.code.contains("renderBody: function(out) {"));
        assert!(unit.code.contains("fancy_card_tag({}, out);"));
    }

    #[test]
    fn test_unknown_tag_policy() {
        let err = compile("<fancy-box></fancy-box>", "views/page.html", &options()).unwrap_err();
        assert_eq!(err.error.code(), ERR_UNKNOWN_TAG);

        let mut lenient = options();
        lenient.allow_unknown_tags = true;
        let unit = compile("<fancy-box></fancy-box>", "views/page.html", &lenient).unwrap();
        assert_eq!(unit.warnings.len(), 1);
        assert!(unit.code.contains("<fancy-box></fancy-box>"));
    }

    #[test]
    fn test_failure_keeps_earlier_warnings() {
        let err = compile(
            r#"<c-if test="data.ok">x</c-if><fancy-box></fancy-box>"#,
            "views/page.html",
            &options(),
        )
        .unwrap_err();
        assert_eq!(err.error.code(), ERR_UNKNOWN_TAG);
        assert_eq!(err.warnings.len(), 1);
        assert_eq!(err.warnings[0].code, WARN_DEPRECATED_TAG);
    }

    #[test]
    fn test_stage_functions_match_compile() {
        let source = r#"<p class="x ${data.cls}">${data.name}</p>"#;
        let options = options();

        let mut builder = create_builder("views/page.html");
        let root = HtmlParser.parse(source, &mut builder).unwrap();
        let mut ctx = CompileContext::new(builder, options.clone(), Arc::new(TaglibLookup::with_core()));
        create_walker(&options).walk(root, &mut ctx).unwrap();
        let unit = generate_code(&ctx.builder, root, &options).unwrap();

        assert_eq!(unit.code, compiled(source).code);
    }

    #[test]
    fn test_compile_file_reuses_up_to_date_output() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("page.html");
        fs::write(&template, "<div>${data.x}</div>").unwrap();
        let options = CompileOptions::default();

        let first = compile_file(&template, &options).unwrap();
        assert!(!first.from_cache);
        let written = fs::read_to_string(dir.path().join("page.html.js")).unwrap();
        assert!(written.starts_with(HASH_HEADER));
        assert!(check_up_to_date(&template, &options));

        let second = compile_file(&template, &options).unwrap();
        assert!(second.from_cache);
        assert_eq!(second.code, first.code);

        fs::write(&template, "<div>${data.y}</div>").unwrap();
        assert!(!check_up_to_date(&template, &options));
        let third = compile_file(&template, &options).unwrap();
        assert!(!third.from_cache);
        assert!(third.code.contains("data.y"));
    }

    #[test]
    fn test_compile_file_recompiles_when_output_settings_change() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("page.html");
        fs::write(&template, "<div>  a   b  </div>").unwrap();
        let options = CompileOptions::default();

        let collapsed = compile_file(&template, &options).unwrap();
        assert!(collapsed.code.contains("<div> a b </div>"));

        let mut preserving = options.clone();
        preserving.preserve_whitespace = PreserveWhitespace::All(true);
        assert!(!check_up_to_date(&template, &preserving));
        let verbatim = compile_file(&template, &preserving).unwrap();
        assert!(!verbatim.from_cache);
        assert!(verbatim.code.contains("<div>  a   b  </div>"));
        assert!(compile_file(&template, &preserving).unwrap().from_cache);

        let mut taglibs = TaglibLookup::with_core();
        taglibs.register(Taglib::new("ui").entry(TaglibEntry::new("fancy-card").renderer("./card")));
        let extended = Compiler::new(preserving.clone()).with_taglibs(Arc::new(taglibs));
        assert!(!extended.is_up_to_date(&template));
        assert!(!extended.compile_file(&template).unwrap().from_cache);
    }

    #[tokio::test]
    async fn test_compile_file_async() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("page.html");
        fs::write(&template, "<b>bold</b>").unwrap();
        let options = CompileOptions::default();

        let first = compile_file_async(&template, &options).await.unwrap();
        assert!(!first.from_cache);
        let second = compile_file_async(&template, &options).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.code, first.code);

        let missing = compile_file_async(dir.path().join("missing.html"), &options).await;
        assert!(missing.is_err());
    }

    #[test]
    fn test_compile_files_in_parallel_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..8 {
            let path = dir.path().join(format!("t{}.html", i));
            let source = if i == 5 {
                "<fancy-box></fancy-box>".to_string()
            } else {
                format!("<p>{}</p>", i)
            };
            fs::write(&path, source).unwrap();
            paths.push(path);
        }

        let results = compile_files(&Compiler::new(options()), &paths);
        assert_eq!(results.len(), 8);
        for (i, result) in results.iter().enumerate() {
            match result {
                Ok(unit) => {
                    assert_ne!(i, 5);
                    assert!(unit.code.contains(&format!("<p>{}</p>", i)));
                }
                Err(failure) => {
                    assert_eq!(i, 5);
                    assert_eq!(failure.error.code(), ERR_UNKNOWN_TAG);
                }
            }
        }
        assert!(!dir.path().join("t0.html.js").exists());
    }
}
