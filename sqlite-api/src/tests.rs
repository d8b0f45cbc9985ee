use std::cell::RefCell;
use std::rc::Rc;

use super::*;

fn memory() -> Connection {
    Connection::open_in_memory().expect("open in-memory db")
}

fn query_one(conn: &Connection, sql: &str) -> DbResult<Vec<Option<String>>> {
    let (mut stmt, _) = conn.compile(sql)?;
    let result = stmt.step()?;
    Ok(result.row.expect("query returns a row"))
}

fn text(conn: &Connection, sql: &str) -> Option<String> {
    query_one(conn, sql).expect("query").remove(0)
}

#[test]
fn test_compile_step_finalize_close() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    let mut conn = Connection::open(&path, 0).expect("open");

    let (mut stmt, remainder) = conn.compile("CREATE TABLE t(a);SELECT 1").expect("compile");
    assert_eq!(remainder, "SELECT 1");
    let result = stmt.step().expect("step");
    assert!(result.is_done());
    assert!(result.columns.is_empty());
    assert!(result.types.is_empty());
    stmt.finalize().expect("finalize");
    drop(stmt);

    conn.close().expect("close");
    let err = conn.last_insert_row_id().expect_err("closed");
    assert_eq!(err, DbError::ClosedHandle(Handle::Database));
}

#[test]
fn test_compile_remainder_is_empty_for_single_statement() {
    let conn = memory();
    let (_, remainder) = conn.compile("SELECT 1").expect("compile");
    assert_eq!(remainder, "");
}

#[test]
fn test_rows_and_metadata() {
    let conn = memory();
    conn.execute_batch(
        "CREATE TABLE people(id INTEGER PRIMARY KEY, name TEXT, note);
         INSERT INTO people(name, note) VALUES ('ada', NULL), ('bo', 'x');",
    )
    .expect("setup");

    let (mut stmt, _) = conn
        .compile("SELECT id, name, note, id + 1 AS next FROM people ORDER BY id")
        .expect("compile");

    let first = stmt.step().expect("first row");
    assert_eq!(&*first.columns, ["id", "name", "note", "next"]);
    assert_eq!(
        &*first.types,
        [Some("INTEGER".to_string()), Some("TEXT".to_string()), None, None]
    );
    assert_eq!(
        first.row,
        Some(vec![Some("1".into()), Some("ada".into()), None, Some("2".into())])
    );

    let second = stmt.step().expect("second row");
    let row = second.row.as_ref().expect("row");
    assert_eq!(row.len(), second.columns.len());
    assert_eq!(second.columns.len(), second.types.len());
    assert_eq!(row[2].as_deref(), Some("x"));

    let done = stmt.step().expect("done");
    assert!(done.is_done());
    assert!(Rc::ptr_eq(&first.columns, &second.columns));
    assert!(Rc::ptr_eq(&first.columns, &done.columns));
    assert!(Rc::ptr_eq(&first.types, &done.types));
}

#[test]
fn test_done_without_rows_reports_columns() {
    let conn = memory();
    conn.execute_batch("CREATE TABLE t(a TEXT)").expect("setup");
    let (mut stmt, _) = conn.compile("SELECT a FROM t").expect("compile");
    let done = stmt.step().expect("step");
    assert!(done.is_done());
    assert_eq!(&*done.columns, ["a"]);
    assert_eq!(&*done.types, [Some("TEXT".to_string())]);
}

#[test]
fn test_empty_compile_is_done() {
    let conn = memory();
    for sql in ["", "   ", "-- nothing here"] {
        let (mut stmt, remainder) = conn.compile(sql).expect("compile");
        assert_eq!(remainder, "");
        let result = stmt.step().expect("step");
        assert!(result.is_done());
        assert!(result.columns.is_empty());
        stmt.finalize().expect("finalize");
        assert!(stmt.is_finalized());
    }
}

#[test]
fn test_bad_sql_fails_compile() {
    let conn = memory();
    let err = conn.compile("SELEC 1").expect_err("syntax error");
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert!(err.message().contains("syntax error"), "{err}");

    let err = conn.compile("SELECT * FROM missing").expect_err("missing table");
    assert_eq!(err.kind(), ErrorKind::Sql);
}

#[test]
fn test_double_finalize() {
    let conn = memory();
    let (mut stmt, _) = conn.compile("SELECT 1").expect("compile");
    stmt.finalize().expect("finalize");
    assert_eq!(
        stmt.finalize().expect_err("second finalize"),
        DbError::ClosedHandle(Handle::Statement)
    );
    assert_eq!(
        stmt.step().expect_err("step after finalize"),
        DbError::ClosedHandle(Handle::Statement)
    );
}

#[test]
fn test_failed_step_finalizes_statement() {
    let conn = memory();
    conn.execute_batch("CREATE TABLE u(x UNIQUE); INSERT INTO u VALUES (1);")
        .expect("setup");
    let (mut stmt, _) = conn.compile("INSERT INTO u VALUES (1)").expect("compile");
    let err = stmt.step().expect_err("duplicate");
    assert_eq!(err.kind(), ErrorKind::Constraint);
    assert!(stmt.is_finalized());
    assert_eq!(
        stmt.finalize().expect_err("already finalized"),
        DbError::ClosedHandle(Handle::Statement)
    );
}

#[test]
fn test_close_twice() {
    let mut conn = memory();
    assert!(!conn.is_closed());
    conn.close().expect("close");
    assert!(conn.is_closed());
    assert_eq!(
        conn.close().expect_err("second close"),
        DbError::ClosedHandle(Handle::Database)
    );
    assert!(conn.compile("SELECT 1").is_err());
    assert!(conn.changes().is_err());
    assert!(conn.interrupt().is_err());
    assert!(conn.busy_timeout(10).is_err());
    assert!(conn.create_function("f", 0, |_, _| Ok(())).is_err());
}

#[test]
fn test_open_rejects_bad_arguments() {
    let err = Connection::open("", 0).expect_err("empty path");
    assert!(matches!(err, DbError::Open { .. }));

    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("missing.db");
    let err = Connection::open(&missing, OpenFlags::READ_ONLY.bits()).expect_err("no file");
    assert_eq!(err.kind(), ErrorKind::CantOpen);
}

#[test]
fn test_changes_and_last_insert_row_id() {
    let conn = memory();
    conn.execute_batch("CREATE TABLE t(a); INSERT INTO t VALUES (1), (2), (3);")
        .expect("setup");
    assert_eq!(conn.changes().expect("changes"), 3);
    assert_eq!(conn.last_insert_row_id().expect("rowid"), 3);
    conn.execute_batch("UPDATE t SET a = 0 WHERE a > 1").expect("update");
    assert_eq!(conn.changes().expect("changes"), 2);
}

#[test]
fn test_execute_batch_error_carries_native_message() {
    let conn = memory();
    let err = conn.execute_batch("CREATE TABLE t(a); CREATE TABLE t(a);").expect_err("dup");
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert!(err.message().contains("already exists"), "{err}");
}

#[test]
fn test_complete_and_metadata() {
    assert!(complete("SELECT 1;"));
    assert!(!complete("SELECT"));
    assert!(!complete("SELECT 'open;"));
    assert!(!complete("SELECT 1;\0"));
    assert!(version().starts_with('3'));
    assert_eq!(ENCODING, "UTF-8");
}

#[test]
fn test_scalar_function() {
    let conn = memory();
    conn.create_function("maim", 1, |ctx, args| {
        let mut chars: Vec<char> = args[0].as_deref().unwrap_or_default().chars().collect();
        chars.sort_unstable();
        ctx.set_result(chars.into_iter().collect::<String>())?;
        Ok(())
    })
    .expect("register");

    assert_eq!(text(&conn, "SELECT maim('Amber')").as_deref(), Some("Abemr"));
    assert_eq!(text(&conn, "SELECT maim(NULL)").as_deref(), Some(""));
    // Names are case-insensitive.
    assert_eq!(text(&conn, "SELECT MAIM('cba')").as_deref(), Some("abc"));
}

#[test]
fn test_variadic_function_sees_all_arguments() {
    let conn = memory();
    conn.create_function("argc", -1, |ctx, args| {
        ctx.set_result(i64::try_from(args.len()).expect("small"))?;
        Ok(())
    })
    .expect("register");
    assert_eq!(text(&conn, "SELECT argc()").as_deref(), Some("0"));
    assert_eq!(text(&conn, "SELECT argc(1, NULL, 'x')").as_deref(), Some("3"));
}

#[test]
fn test_failing_function_is_contained() {
    let conn = memory();
    conn.create_function("fails", 0, |ctx, _| {
        ctx.set_result(Vec::<u8>::new())?;
        Ok(())
    })
    .expect("register");
    conn.create_function("panics", 0, |_, _| panic!("host failure"))
        .expect("register");

    for sql in ["SELECT fails()", "SELECT panics()"] {
        let err = query_one(&conn, sql).expect_err("contained failure");
        assert_eq!(err.kind(), ErrorKind::Sql);
        assert_eq!(err.message(), FUNCTION_FAILED);
    }

    // The connection stays usable.
    assert_eq!(text(&conn, "SELECT 1 + 1").as_deref(), Some("2"));
}

#[test]
fn test_set_result_rejects_unsupported_types() {
    let conn = memory();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    conn.create_function("probe", 0, move |ctx, _| {
        sink.borrow_mut().push(ctx.set_result(Value::Null).expect_err("null"));
        sink.borrow_mut().push(ctx.set_result(vec![1_u8]).expect_err("blob"));
        assert_eq!(ctx.set_result(2.5).expect("float"), Value::Float(2.5));
        Ok(())
    })
    .expect("register");

    assert_eq!(text(&conn, "SELECT probe()").as_deref(), Some("2.5"));
    assert_eq!(
        *seen.borrow(),
        [DbError::BadResultType("null"), DbError::BadResultType("blob")]
    );
}

#[test]
fn test_set_result_error() {
    let conn = memory();
    conn.create_function("reject", 1, |ctx, args| {
        let message = format!("rejected {}", args[0].as_deref().unwrap_or("null"));
        assert_eq!(ctx.set_result_error(&message), message);
        Ok(())
    })
    .expect("register");
    let err = query_one(&conn, "SELECT reject('x')").expect_err("error result");
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert_eq!(err.message(), "rejected x");
}

#[test]
fn test_aggregate_context_and_count() {
    let conn = memory();
    conn.execute_batch(
        "CREATE TABLE words(g TEXT, w TEXT);
         INSERT INTO words VALUES ('a', 'Amber'), ('a', 'Bo'), ('b', 'Cyd');",
    )
    .expect("setup");

    let counts = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&counts);
    conn.create_aggregate(
        "lengths",
        1,
        move |ctx, args| {
            sink.borrow_mut().push(ctx.aggregate_count()?);
            let len = i64::try_from(args[0].as_deref().map_or(0, str::len)).expect("small");
            let total = ctx
                .aggregate_context()?
                .entry("total".to_string())
                .or_insert(Value::Integer(0));
            *total = Value::Integer(total.as_i64().unwrap_or(0) + len);
            Ok(())
        },
        |ctx| {
            let total = ctx
                .aggregate_context()?
                .get("total")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            ctx.set_result(total)?;
            Ok(())
        },
    )
    .expect("register");

    let (mut stmt, _) = conn
        .compile("SELECT g, lengths(w) FROM words GROUP BY g ORDER BY g")
        .expect("compile");
    let a = stmt.step().expect("group a").row.expect("row");
    let b = stmt.step().expect("group b").row.expect("row");
    assert!(stmt.step().expect("done").is_done());
    assert_eq!(a, [Some("a".to_string()), Some("7".to_string())]);
    assert_eq!(b, [Some("b".to_string()), Some("3".to_string())]);
    assert_eq!(*counts.borrow(), [1, 2, 1]);
}

#[test]
fn test_aggregate_over_empty_table() {
    let conn = memory();
    conn.execute_batch("CREATE TABLE t(a)").expect("setup");
    conn.create_aggregate(
        "rows_seen",
        1,
        |_, _| Ok(()),
        |ctx| {
            let seen = ctx.aggregate_count()?;
            ctx.set_result(seen)?;
            Ok(())
        },
    )
    .expect("register");
    assert_eq!(text(&conn, "SELECT rows_seen(a) FROM t").as_deref(), Some("0"));
}

fn register_total_len(conn: &Connection) {
    conn.create_aggregate(
        "total_len",
        1,
        |ctx, args| {
            let len = i64::try_from(args[0].as_deref().map_or(0, str::len)).expect("small");
            let total = ctx
                .aggregate_context()?
                .entry("total".to_string())
                .or_insert(Value::Integer(0));
            *total = Value::Integer(total.as_i64().unwrap_or(0) + len);
            Ok(())
        },
        |ctx| {
            let total = ctx
                .aggregate_context()?
                .get("total")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            ctx.set_result(total)?;
            Ok(())
        },
    )
    .expect("register");
}

#[test]
fn test_same_aggregate_twice_keeps_groups_apart() {
    let conn = memory();
    conn.execute_batch(
        "CREATE TABLE words(g TEXT, w TEXT);
         INSERT INTO words VALUES ('a', 'Amber'), ('a', 'Bo'), ('bb', 'Cyd');",
    )
    .expect("setup");
    register_total_len(&conn);

    let (mut stmt, _) = conn
        .compile("SELECT g, total_len(w), total_len(g) FROM words GROUP BY g ORDER BY g")
        .expect("compile");
    let a = stmt.step().expect("group a").row.expect("row");
    let b = stmt.step().expect("group bb").row.expect("row");
    assert!(stmt.step().expect("done").is_done());
    assert_eq!(a, [Some("a".to_string()), Some("7".to_string()), Some("2".to_string())]);
    assert_eq!(b, [Some("bb".to_string()), Some("3".to_string()), Some("2".to_string())]);
}

#[test]
fn test_failing_aggregate_step_is_contained() {
    let conn = memory();
    conn.execute_batch("CREATE TABLE t(a TEXT); INSERT INTO t VALUES ('ok'), ('bad');")
        .expect("setup");
    conn.create_aggregate(
        "refuses",
        1,
        |ctx, args| {
            if args[0].as_deref() == Some("bad") {
                ctx.set_result(Value::Null)?;
            }
            Ok(())
        },
        |ctx| {
            ctx.set_result(0)?;
            Ok(())
        },
    )
    .expect("register");
    conn.create_aggregate(
        "explodes",
        1,
        |_, args| {
            assert_ne!(args[0].as_deref(), Some("bad"), "step failure");
            Ok(())
        },
        |ctx| {
            ctx.set_result(0)?;
            Ok(())
        },
    )
    .expect("register");
    register_total_len(&conn);

    for sql in ["SELECT refuses(a) FROM t", "SELECT explodes(a) FROM t"] {
        let err = query_one(&conn, sql).expect_err("contained failure");
        assert_eq!(err.kind(), ErrorKind::Sql);
        assert_eq!(err.message(), FUNCTION_FAILED);
    }

    // Aggregates keep working after an aborted group.
    assert_eq!(text(&conn, "SELECT total_len(a) FROM t").as_deref(), Some("5"));
}

#[test]
fn test_failing_function_during_execute_batch() {
    let conn = memory();
    conn.create_function("boom", 0, |_, _| panic!("host failure"))
        .expect("register");
    let err = conn.execute_batch("SELECT boom();").expect_err("contained failure");
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert_eq!(err.message(), FUNCTION_FAILED);
    conn.execute_batch("CREATE TABLE after_failure(a)").expect("still usable");
}

#[test]
fn test_numeric_type_keeps_non_numeric_text() {
    let conn = memory();
    conn.create_function("echo", 1, |ctx, args| {
        ctx.set_result(args[0].clone().unwrap_or_default())?;
        Ok(())
    })
    .expect("register");
    conn.function_type("echo", FunctionType::Numeric).expect("numeric");
    for literal in ["nan", "inf", "1e999"] {
        let row = query_one(&conn, &format!("SELECT typeof(echo('{literal}')), echo('{literal}')"))
            .expect("query");
        assert_eq!(row, [Some("text".to_string()), Some(literal.to_string())]);
    }
}

#[test]
fn test_function_names_fold_ascii_case_only() {
    let conn = memory();
    conn.create_function("äf", 0, |ctx, _| {
        ctx.set_result("1")?;
        Ok(())
    })
    .expect("register");
    conn.function_type("äF", FunctionType::Numeric).expect("ascii fold");
    assert_eq!(text(&conn, "SELECT typeof(äf())").as_deref(), Some("integer"));
    let err = conn
        .function_type("Äf", FunctionType::Text)
        .expect_err("engine treats Äf as another function");
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert_eq!(text(&conn, "SELECT typeof(äf())").as_deref(), Some("integer"));
}

#[test]
fn test_failing_aggregate_finalize_is_contained() {
    let conn = memory();
    conn.create_aggregate("broken", 0, |_, _| Ok(()), |_| panic!("finalize failure"))
        .expect("register");
    let err = query_one(&conn, "SELECT broken()").expect_err("contained");
    assert_eq!(err.message(), AGGREGATE_FINALIZE_FAILED);
}

#[test]
fn test_scalar_has_no_aggregate_context() {
    let conn = memory();
    conn.create_function("scalar", 0, |ctx, _| {
        assert_eq!(ctx.aggregate_count().expect_err("scalar").kind(), ErrorKind::Misuse);
        assert!(ctx.aggregate_context().is_err());
        ctx.set_result(1)?;
        Ok(())
    })
    .expect("register");
    assert_eq!(text(&conn, "SELECT scalar()").as_deref(), Some("1"));
}

#[test]
fn test_function_type_coerces_results() {
    let conn = memory();
    conn.create_function("echo", 1, |ctx, args| {
        ctx.set_result(args[0].clone().unwrap_or_default())?;
        Ok(())
    })
    .expect("register");
    conn.create_function("seven", 0, |ctx, _| {
        ctx.set_result(7)?;
        Ok(())
    })
    .expect("register");

    assert_eq!(text(&conn, "SELECT typeof(echo('42'))").as_deref(), Some("text"));
    conn.function_type("echo", FunctionType::Numeric).expect("numeric");
    assert_eq!(text(&conn, "SELECT typeof(echo('42'))").as_deref(), Some("integer"));
    assert_eq!(text(&conn, "SELECT typeof(echo('4.5'))").as_deref(), Some("real"));
    assert_eq!(text(&conn, "SELECT typeof(echo('abc'))").as_deref(), Some("text"));

    conn.function_type("SEVEN", FunctionType::Text).expect("text");
    assert_eq!(text(&conn, "SELECT typeof(seven())").as_deref(), Some("text"));

    conn.function_type("echo", FunctionType::Argument(0)).expect("argument");
    assert_eq!(text(&conn, "SELECT typeof(echo(5))").as_deref(), Some("integer"));
    assert_eq!(text(&conn, "SELECT typeof(echo('5'))").as_deref(), Some("text"));

    let err = conn
        .function_type("nope", FunctionType::Numeric)
        .expect_err("unregistered");
    assert_eq!(err.kind(), ErrorKind::Sql);
    assert_eq!(err.message(), "function type nope(-1)");
}

#[test]
fn test_function_type_visible_in_context() {
    let conn = memory();
    let seen = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&seen);
    conn.create_function("kind", 0, move |ctx, _| {
        *sink.borrow_mut() = Some(ctx.function_type());
        ctx.set_result(0)?;
        Ok(())
    })
    .expect("register");
    conn.function_type("kind", FunctionType::Argument(3)).expect("type");
    query_one(&conn, "SELECT kind()").expect("call");
    assert_eq!(*seen.borrow(), Some(FunctionType::Argument(3)));
}

#[test]
fn test_rejected_registration_names_signature() {
    let conn = memory();
    let err = conn
        .create_function("f", -2, |_, _| Ok(()))
        .expect_err("bad arity");
    assert_eq!(err.kind(), ErrorKind::Misuse);
    assert_eq!(err.message(), "create function f(-2)");

    let err = conn
        .create_aggregate("g", -2, |_, _| Ok(()), |_| Ok(()))
        .expect_err("bad arity");
    assert_eq!(err.message(), "create aggregate g(-2)");
}

#[test]
fn test_replacing_a_function() {
    let conn = memory();
    conn.create_function("answer", 0, |ctx, _| {
        ctx.set_result(1)?;
        Ok(())
    })
    .expect("register");
    conn.create_function("answer", 0, |ctx, _| {
        ctx.set_result(42)?;
        Ok(())
    })
    .expect("replace");
    assert_eq!(text(&conn, "SELECT answer()").as_deref(), Some("42"));
}

#[test]
fn test_interrupt_from_callback() {
    let conn = memory();
    let handle = conn.interrupt_handle().expect("handle");
    conn.create_function("stop", 1, move |ctx, _| {
        handle.interrupt();
        ctx.set_result(0)?;
        Ok(())
    })
    .expect("register");

    let (mut stmt, _) = conn
        .compile(
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 1000)
             SELECT stop(x) FROM c",
        )
        .expect("compile");
    let err = loop {
        match stmt.step() {
            Ok(result) if result.is_row() => {}
            Ok(_) => panic!("statement ran to completion"),
            Err(err) => break err,
        }
    };
    assert_eq!(err.kind(), ErrorKind::Interrupt);
    assert!(stmt.is_finalized());
    drop(stmt);

    assert_eq!(text(&conn, "SELECT 3").as_deref(), Some("3"));
}

#[test]
fn test_interrupt_handle_is_inert_after_close() {
    let mut conn = memory();
    let handle = conn.interrupt_handle().expect("handle");
    conn.close().expect("close");
    handle.interrupt();
}

#[test]
fn test_functions_survive_until_close() {
    let mut conn = memory();
    let marker = Rc::new(());
    let held = Rc::clone(&marker);
    conn.create_function("held", 0, move |ctx, _| {
        ctx.set_result(i64::try_from(Rc::strong_count(&held)).expect("count"))?;
        Ok(())
    })
    .expect("register");
    assert_eq!(Rc::strong_count(&marker), 2);
    conn.close().expect("close");
    drop(conn);
    assert_eq!(Rc::strong_count(&marker), 1);
}

#[test]
fn test_busy_policy_released_on_replace_and_close() {
    let mut conn = memory();
    let marker = Rc::new(());
    let held = Rc::clone(&marker);
    conn.busy_handler(Some(Box::new(move |_, _| Rc::strong_count(&held) > 0)))
        .expect("install handler");
    assert_eq!(Rc::strong_count(&marker), 2);
    conn.busy_timeout(10).expect("replace with timeout");
    assert_eq!(Rc::strong_count(&marker), 1);

    let held = Rc::clone(&marker);
    conn.busy_handler(Some(Box::new(move |_, _| Rc::strong_count(&held) > 0)))
        .expect("install handler");
    let mut moved = Box::new(conn);
    assert_eq!(Rc::strong_count(&marker), 2);
    moved.close().expect("close");
    assert_eq!(Rc::strong_count(&marker), 1);
}
