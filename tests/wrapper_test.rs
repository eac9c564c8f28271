mod helpers;

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use memoria::error::HandlerError;
use memoria::memory::store::{EventStore, SqliteEventStore};
use memoria::memory::summarize::looks_like_json;
use memoria::memory::types::EventType;
use memoria::tools::{BUSCAR, GLOBAL, GUARDAR, HISTORIAL, STATUS};
use memoria::wrapper::handler::fn_handler;
use memoria::wrapper::request::ToolRequest;

use helpers::{
    make_event, metadata, status_handler, test_config, test_db, FailingEmbedder, Harness,
    HangingThread, StallingStore,
};

fn in_session(tool: &str, session: &str) -> ToolRequest {
    ToolRequest::new(tool).with_header("Session-ID", session)
}

fn assert_enveloped(body: &Value) {
    assert!(body["success"].is_boolean(), "missing success in {body}");
    let meta = metadata(body);
    assert_eq!(meta["wrapper_aplicado"], json!(true));
    let session = meta["session_info"]["session_id"].as_str().unwrap_or_default();
    assert!(!session.is_empty(), "missing session_info in {body}");
    let answer = body["respuesta_usuario"].as_str().unwrap_or_default();
    assert!(!answer.trim().is_empty(), "missing respuesta_usuario in {body}");
}

// ── Identity ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn hintless_request_gets_deterministic_identity() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![status_handler("diagnostico-recursos")]);

    let req = ToolRequest::new("diagnostico-recursos").with_header("User-Agent", "agent-host/1.0");
    let res = wrapper.dispatch(req).await;
    assert_eq!(res.status, 200);
    assert_enveloped(&res.body);

    let meta = metadata(&res.body);
    let session = meta["session_info"]["session_id"].as_str().unwrap().to_string();
    assert!(session.starts_with("auto_"));
    assert_eq!(session.len(), "auto_".len() + 16);
    assert_eq!(meta["session_info"]["source"], json!("deterministic"));
    assert_eq!(meta["identity_degraded"], json!(true));

    let events = h.session_events(&session).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::EndpointCall);

    // Same caller, same conversation.
    let again = ToolRequest::new("diagnostico-recursos").with_header("User-Agent", "agent-host/1.0");
    let res = wrapper.dispatch(again).await;
    assert_eq!(metadata(&res.body)["session_info"]["session_id"], json!(session));
}

#[tokio::test]
async fn request_without_anything_lands_in_fallback_session() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![]);

    let res = wrapper.dispatch(ToolRequest::new(STATUS)).await;
    assert_enveloped(&res.body);
    let meta = metadata(&res.body);
    assert_eq!(meta["session_info"]["session_id"], json!("fallback_session"));
    assert_eq!(meta["session_info"]["source"], json!("fallback"));
    assert_eq!(meta["identity_degraded"], json!(true));
    assert_eq!(h.session_events("fallback_session").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn hanging_thread_api_downgrades_to_deterministic_identity() {
    let mut config = test_config();
    config.identity.upstream_enabled = true;
    config.identity.hosted = Some(true);
    let h = Harness::with_thread_source(config, Arc::new(HangingThread));
    let wrapper = h.wrapper(vec![status_handler("diagnostico-recursos")]);

    let caller = |n: usize| {
        ToolRequest::new("diagnostico-recursos")
            .with_header("User-Agent", format!("agent-host/{n}.0"))
            .with_header("X-Forwarded-For", "10.1.2.3")
    };

    let mut tasks = Vec::new();
    for n in 0..8 {
        let wrapper = wrapper.clone();
        let req = caller(n);
        tasks.push(tokio::spawn(async move { wrapper.dispatch(req).await }));
    }

    let started = tokio::time::Instant::now();
    let mut sessions = Vec::new();
    for (n, task) in tasks.into_iter().enumerate() {
        let res = task.await.unwrap();
        assert_enveloped(&res.body);
        let info = &metadata(&res.body)["session_info"];
        assert_eq!(info["source"], json!("deterministic"), "caller {n}: {info}");
        let expected = h.services.resolver.resolve_local(&caller(n)).session_id;
        assert!(expected.starts_with("auto_"));
        assert_eq!(info["session_id"], json!(expected));
        sessions.push(expected);
    }
    assert!(started.elapsed() < Duration::from_secs(30));
    sessions.sort();
    sessions.dedup();
    assert_eq!(sessions.len(), 8);
    assert!(h.session_events("fallback_session").await.is_empty());
}

// ── Continuity ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn third_call_sees_the_first_two() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![status_handler("diagnostico-recursos")]);

    for _ in 0..2 {
        let res = wrapper.dispatch(in_session("diagnostico-recursos", "S1")).await;
        assert_eq!(res.body["success"], json!(true));
    }

    let probe = fn_handler("inspeccionar", |_req, ctx| async move {
        Ok(json!({
            "success": true,
            "recientes": ctx.interacciones_recientes.len(),
            "total": ctx.total_interacciones_sesion,
            "mensaje": "Contexto inspeccionado para la sesión actual",
        }))
    });
    let wrapper = h.wrapper(vec![probe]);
    let res = wrapper.dispatch(in_session("inspeccionar", "S1")).await;
    let body = &res.body;

    assert!(body["recientes"].as_u64().unwrap() >= 2);
    assert_eq!(body["total"], json!(2));
    assert_eq!(metadata(body)["memoria_aplicada"], json!(true));
    let mensaje = body["contexto_conversacion"]["mensaje"].as_str().unwrap();
    assert_eq!(mensaje, "Continuando conversación con 2 interacciones previas");
    assert!(!body["contexto_conversacion"]["resumen"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn first_call_has_no_continuity_block() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![]);
    let res = wrapper.dispatch(in_session(STATUS, "NUEVA")).await;
    assert_eq!(metadata(&res.body)["memoria_aplicada"], json!(false));
    assert!(res.body.get("contexto_conversacion").is_none());
}

#[tokio::test]
async fn session_scoped_vector_recall() {
    let h = Harness::keyword();
    for i in 0..3 {
        let event = make_event(
            &format!("S2_diagnostico-recursos_{i}"),
            "S2",
            &format!("Diagnóstico completado con error: Docker container misconfigured en nodo-{i}"),
            1_700_000_000 + i,
        );
        h.services.store.upsert(&event).await.unwrap();
    }
    let other = make_event(
        "S3_diagnostico-recursos_0",
        "S3",
        "Diagnóstico completado con error: Docker container misconfigured en otra sesión",
        1_700_000_500,
    );
    h.services.store.upsert(&other).await.unwrap();
    h.index_pending().await;

    let probe = fn_handler("inspeccionar", |_req, ctx| async move {
        let sessions: Vec<String> = ctx
            .docs_vectoriales
            .iter()
            .map(|hit| hit.doc.session_id.clone())
            .collect();
        Ok(json!({ "success": true, "sesiones": sessions }))
    });
    let wrapper = h.wrapper(vec![probe]);
    let req = in_session("inspeccionar", "S2")
        .with_body(json!({"query": "configuración del contenedor docker"}));
    let res = wrapper.dispatch(req).await;

    let sessions = res.body["sesiones"].as_array().unwrap();
    assert_eq!(sessions.len(), 3);
    assert!(sessions.iter().all(|s| s == "S2"));
    assert_eq!(metadata(&res.body)["contexto_items"]["vectoriales"], json!(3));
    assert_eq!(metadata(&res.body)["embedding_unavailable"], json!(false));
}

// ── Degradation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn save_then_search_without_embeddings() {
    let h = Harness::new(Some(Arc::new(FailingEmbedder)));
    let wrapper = h.wrapper(vec![]);

    let save = in_session(GUARDAR, "S4").with_body(json!({
        "contenido": "El contenedor de Docker quedó mal configurado tras la actualización",
        "tipo": "incidente",
    }));
    let res = wrapper.dispatch(save).await;
    assert_eq!(res.body["success"], json!(true));
    assert!(res.body.get("registro_memoria").is_none());

    let saved = h.session_events("S4").await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].event_type, EventType::Snapshot);
    assert_eq!(saved[0].endpoint, GUARDAR);
    assert_eq!(saved[0].metadata["registro"]["tipo"], json!("incidente"));

    let search = in_session(BUSCAR, "S4").with_body(json!({"query": "contenedor configurado"}));
    let res = wrapper.dispatch(search).await;
    let body = &res.body;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["modo"], json!("texto"));
    assert!(body["total"].as_u64().unwrap() >= 1);
    assert_eq!(metadata(body)["embedding_unavailable"], json!(true));
}

#[tokio::test]
async fn saved_memory_keeps_caller_metadata_under_the_resolved_session() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![]);

    let save = in_session(GUARDAR, "S4h").with_body(json!({
        "contenido": "Las copias de seguridad se verifican los lunes a las 06:00",
        "tipo": "procedimiento",
        "session_id": "S4b",
        "metadata": {"ticket": "OPS-31", "autor": "guardia"},
    }));
    let res = wrapper.dispatch(save).await;
    assert_eq!(res.body["guardado"]["session_id"], json!("S4h"));
    assert_eq!(metadata(&res.body)["session_info"]["session_id"], json!("S4h"));

    assert!(h.session_events("S4b").await.is_empty());
    let saved = h.session_events("S4h").await;
    assert_eq!(saved.len(), 1);
    let registro = &saved[0].metadata["registro"];
    assert_eq!(registro["tipo"], json!("procedimiento"));
    assert_eq!(registro["metadata_usuario"]["ticket"], json!("OPS-31"));
    assert_eq!(saved[0].metadata["wrapper_aplicado"], json!(true));
}

#[tokio::test]
async fn handler_error_is_classified_and_persisted() {
    let h = Harness::new(None);
    let failing = fn_handler("ejecutar-script", |_req, _ctx| async move {
        Err(HandlerError::Internal("boom\n    at script.rs:10".into()))
    });
    let wrapper = h.wrapper(vec![failing]);

    let res = wrapper.dispatch(in_session("ejecutar-script", "S5")).await;
    assert_eq!(res.status, 200);
    assert_enveloped(&res.body);
    assert_eq!(res.body["success"], json!(false));
    assert_eq!(res.body["error"], json!("error_interno: boom"));
    assert_eq!(metadata(&res.body)["handler_error"], json!(true));

    let events = h.session_events("S5").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Error);
    assert!(!events[0].success);
    assert!(!events[0].texto_semantico.contains("script.rs"));
}

#[tokio::test]
async fn handler_panic_is_contained() {
    let h = Harness::new(None);
    let panicking = fn_handler("ejecutar-cli", |_req, _ctx| async move {
        if true {
            panic!("boom");
        }
        Ok(json!({}))
    });
    let wrapper = h.wrapper(vec![panicking]);

    let res = wrapper.dispatch(in_session("ejecutar-cli", "S5b")).await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body["success"], json!(false));
    assert_eq!(res.body["error"], json!("handler_panic: boom"));
    assert_eq!(h.session_events("S5b").await[0].event_type, EventType::Error);
}

#[tokio::test]
async fn global_view_collapses_cross_session_duplicates() {
    let h = Harness::new(None);
    let prefix = "Diagnóstico completado con error: el contenedor docker del servicio de pagos no arranca por variables ";
    assert!(prefix.chars().count() >= 100);
    let rows = [("S6a", "ausentes"), ("S6b", "mal escritas"), ("S6c", "duplicadas"), ("S6a", "vacías")];
    for (i, (session, tail)) in rows.iter().enumerate() {
        let event = make_event(
            &format!("{session}_diagnostico-recursos_{i}"),
            session,
            &format!("{prefix}{tail}"),
            1_700_000_000 + i as i64,
        );
        h.services.store.upsert(&event).await.unwrap();
    }

    let wrapper = h.wrapper(vec![]);
    let res = wrapper.dispatch(in_session(GLOBAL, "S6z")).await;
    let body = &res.body;
    assert_eq!(body["success"], json!(true));

    let reps = body["representantes"].as_array().unwrap();
    assert_eq!(reps.len(), 1);
    assert_eq!(reps[0]["duplicados"], json!(3));
    assert_eq!(reps[0]["sesiones"].as_array().unwrap().len(), 3);
    assert_eq!(body["duplicados_suprimidos"], json!(3));
}

#[tokio::test]
async fn global_view_reaches_past_a_burst_of_duplicates() {
    let h = Harness::new(None);
    h.services
        .store
        .upsert(&make_event(
            "S6d_diagnostico-recursos_0",
            "S6d",
            "Se leyó el archivo /etc/ssh/sshd_config (3072 caracteres)",
            1_600_000_000,
        ))
        .await
        .unwrap();
    for i in 0..150 {
        let session = format!("S6r{}", i % 5);
        let event = make_event(
            &format!("{session}_diagnostico-recursos_{i}"),
            &session,
            "Diagnóstico completado con éxito: el balanceador de carga responde en todos los nodos",
            1_700_000_000 + i,
        );
        h.services.store.upsert(&event).await.unwrap();
    }

    let wrapper = h.wrapper(vec![]);
    let res = wrapper.dispatch(in_session(GLOBAL, "S6z")).await;
    let body = &res.body;

    let reps = body["representantes"].as_array().unwrap();
    assert_eq!(reps.len(), 2);
    assert_eq!(reps[0]["duplicados"], json!(149));
    assert_eq!(reps[1]["id"], json!("S6d_diagnostico-recursos_0"));
    assert_eq!(body["eventos_revisados"], json!(151));
    assert_eq!(body["revision_completa"], json!(true));
    assert_eq!(body["query_used"]["cobertura"], json!("todas las sesiones"));

    let limited = wrapper
        .dispatch(in_session(GLOBAL, "S6z").with_query("limit", "1"))
        .await;
    assert_eq!(limited.body["representantes"].as_array().unwrap().len(), 1);
    assert_eq!(limited.body["revision_completa"], json!(false));
    assert_eq!(limited.body["eventos_revisados"], json!(100));
}

#[tokio::test]
async fn failing_embeddings_never_fail_requests() {
    let h = Harness::new(Some(Arc::new(FailingEmbedder)));
    let wrapper = h.wrapper(vec![status_handler("diagnostico-recursos")]);

    for query in ["estado del clúster", "errores de ayer", "últimas 24 horas de diagnósticos"] {
        let req = in_session("diagnostico-recursos", "S9").with_body(json!({ "query": query }));
        let res = wrapper.dispatch(req).await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body["success"], json!(true));
        assert_eq!(metadata(&res.body)["embedding_unavailable"], json!(true));
    }
    assert_eq!(h.session_events("S9").await.len(), 6);
}

#[tokio::test(start_paused = true)]
async fn stalled_store_is_bounded_by_the_total_budget() {
    let config = test_config();
    let db = test_db();
    let store: Arc<dyn EventStore> = Arc::new(StallingStore {
        inner: SqliteEventStore::new(db.clone()),
        stall: Duration::from_secs(25),
    });
    let h = Harness::with_store(None, config, db, store);
    let slow = fn_handler("diagnostico-recursos", |_req, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(json!({"success": true, "mensaje": "Diagnóstico lento completado sin hallazgos"}))
    });
    let wrapper = h.wrapper(vec![slow]);

    let started = tokio::time::Instant::now();
    let res = wrapper.dispatch(in_session("diagnostico-recursos", "S10")).await;
    let elapsed = started.elapsed();

    assert!(elapsed <= Duration::from_secs(30), "took {elapsed:?}");
    assert_eq!(res.status, 200);
    assert_eq!(res.body["success"], json!(true));
    let meta = metadata(&res.body);
    assert_eq!(meta["truncated"], json!(true));
    assert_eq!(meta["retrieval_unavailable"], json!(true));
    assert_eq!(meta["persistence_failed"], json!(true));
    assert_eq!(meta["eventos_persistidos"], json!([]));
}

#[tokio::test]
async fn slow_handler_times_out() {
    let mut config = test_config();
    config.wrapper.total_budget_ms = 600;
    config.wrapper.persist_budget_ms = 200;
    let h = Harness::with_config(None, config);
    let slow = fn_handler("ejecutar-script", |_req, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!({"success": true}))
    });
    let wrapper = h.wrapper(vec![slow]);

    let res = wrapper.dispatch(in_session("ejecutar-script", "S11")).await;
    assert_eq!(res.body["success"], json!(false));
    assert_eq!(res.body["error"], json!("tiempo_agotado: handler exceeded its deadline"));
    let meta = metadata(&res.body);
    assert_eq!(meta["truncated"], json!(true));
    assert_eq!(meta["handler_error"], json!(true));
}

// ── Envelope and events ───────────────────────────────────────────────────────

#[tokio::test]
async fn odd_responses_still_get_an_envelope() {
    let h = Harness::new(None);
    let scalar = fn_handler("contar", |_req, _ctx| async move { Ok(json!(42)) });
    let exito = fn_handler("legado", |_req, _ctx| async move {
        Ok(json!({"exito": false, "error": "recurso no disponible"}))
    });
    let wrapper = h.wrapper(vec![scalar, exito]);

    let res = wrapper.dispatch(in_session("contar", "S12")).await;
    assert_enveloped(&res.body);
    assert_eq!(res.body["data"], json!(42));
    assert_eq!(res.body["respuesta_usuario"], json!("Solicitud procesada correctamente."));

    let res = wrapper.dispatch(in_session("legado", "S12")).await;
    assert_enveloped(&res.body);
    assert_eq!(res.body["success"], json!(false));
    assert_eq!(
        res.body["respuesta_usuario"],
        json!("No se pudo completar la solicitud: recurso no disponible")
    );
}

#[tokio::test]
async fn foreign_metadata_falls_back_to_original_response() {
    let h = Harness::new(None);
    let odd = fn_handler("raro", |_req, _ctx| async move {
        Ok(json!({"success": true, "metadata": "no soy un objeto"}))
    });
    let wrapper = h.wrapper(vec![odd]);

    let res = wrapper.dispatch(in_session("raro", "S13")).await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body["success"], json!(true));
    let meta = metadata(&res.body);
    assert_eq!(meta["wrapper_aplicado"], json!(true));
    assert!(meta["memoria_error"].is_string());
    assert_eq!(meta["original"], json!("no soy un objeto"));
    assert_eq!(h.session_events("S13").await.len(), 1);
}

#[tokio::test]
async fn summaries_are_not_payload_dumps() {
    let h = Harness::new(None);
    let bulky = fn_handler("listar-recursos", |_req, _ctx| async move {
        let recursos: Vec<Value> = (0..50)
            .map(|i| json!({"nombre": format!("vm-{i}"), "estado": "running", "cpu": i}))
            .collect();
        Ok(json!({"success": true, "datos": {"recursos": recursos}}))
    });
    let wrapper = h.wrapper(vec![bulky]);
    let req = in_session("listar-recursos", "S14").with_body(json!({"query": "lista las máquinas virtuales"}));
    wrapper.dispatch(req).await;

    let events = h.session_events("S14").await;
    assert_eq!(events.len(), 2);
    for event in &events {
        let serialized = serde_json::to_string(&event.response_data).unwrap();
        assert!(!looks_like_json(&event.texto_semantico), "{}", event.texto_semantico);
        assert!(event.texto_semantico.chars().count() <= 300);
        assert_ne!(event.texto_semantico, serialized);
    }
    let input = events.iter().find(|e| e.event_type == EventType::UserInput).unwrap();
    assert_eq!(input.texto_semantico, "El usuario solicitó: lista las máquinas virtuales");
}

#[tokio::test]
async fn large_responses_are_stored_truncated() {
    let mut config = test_config();
    config.wrapper.max_response_bytes = 256;
    let h = Harness::with_config(None, config);
    let big = fn_handler("leer-archivo", |_req, _ctx| async move {
        Ok(json!({"success": true, "ruta": "/var/log/syslog", "contenido": "x".repeat(4096)}))
    });
    let wrapper = h.wrapper(vec![big]);

    let res = wrapper
        .dispatch(in_session("leer-archivo", "S15").with_body(json!({"ruta": "/var/log/syslog"})))
        .await;
    // The caller still gets the full response.
    assert_eq!(res.body["contenido"].as_str().unwrap().len(), 4096);

    let events = h.session_events("S15").await;
    assert_eq!(events[0].response_data["_truncado"], json!(true));
    assert_eq!(
        events[0].texto_semantico,
        "Se leyó el archivo /var/log/syslog (4096 caracteres)"
    );
}

#[tokio::test]
async fn secrets_are_redacted_from_stored_params() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![status_handler("ejecutar-cli")]);
    let req = in_session("ejecutar-cli", "S16").with_body(json!({
        "comando": "az vm list",
        "api_key": "sk-live-123",
    }));
    wrapper.dispatch(req).await;

    let events = h.session_events("S16").await;
    assert_eq!(events[0].params["api_key"], json!("***"));
    assert_eq!(events[0].params["comando"], json!("az vm list"));
}

#[tokio::test]
async fn identical_calls_get_distinct_ids() {
    let h = Harness::keyword();
    let wrapper = h.wrapper(vec![status_handler("diagnostico-recursos")]);

    let mut ids = Vec::new();
    for _ in 0..2 {
        let res = wrapper.dispatch(in_session("diagnostico-recursos", "S17")).await;
        for id in res.body["metadata"]["eventos_persistidos"].as_array().unwrap() {
            ids.push(id.as_str().unwrap().to_string());
        }
    }
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    h.index_pending().await;
    let docs = h.services.index.count().await.unwrap();
    assert_eq!(docs, 2);

    // Replaying the feed upserts the same documents.
    h.services.index.set_checkpoint(0).await.unwrap();
    h.index_pending().await;
    assert_eq!(h.services.index.count().await.unwrap(), docs);
}

#[tokio::test]
async fn concurrent_sessions_stay_partitioned() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![status_handler("diagnostico-recursos")]);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let wrapper = wrapper.clone();
        let session = if i % 2 == 0 { "SA" } else { "SB" };
        tasks.push(tokio::spawn(async move {
            wrapper.dispatch(in_session("diagnostico-recursos", session)).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().status, 200);
    }

    for session in ["SA", "SB"] {
        let events = h.session_events(session).await;
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.session_id == session));
    }
}

#[tokio::test]
async fn deferred_writes_land_eventually() {
    let mut config = test_config();
    config.wrapper.deferred_writes = true;
    let h = Harness::with_config(None, config);
    let wrapper = h.wrapper(vec![]);

    let res = wrapper.dispatch(in_session(STATUS, "S18")).await;
    assert_eq!(metadata(&res.body)["persistence_deferred"], json!(true));

    let mut found = 0;
    for _ in 0..100 {
        found = h.session_events("S18").await.len();
        if found > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(found, 1);
}

// ── Tools through the wrapper ─────────────────────────────────────────────────

#[tokio::test]
async fn history_maps_intent_to_filters() {
    let h = Harness::new(None);
    let now = chrono::Utc::now().timestamp();
    let mut failed = make_event("S19_ejecutar-script_1", "S19", "ejecutar-script falló: permiso denegado al ejecutar", now - 60);
    failed.event_type = EventType::Error;
    failed.success = false;
    failed.endpoint = "ejecutar-script".into();
    h.services.store.upsert(&failed).await.unwrap();
    h.services
        .store
        .upsert(&make_event("S19_diagnostico-recursos_2", "S19", "Diagnóstico completado con éxito: todo en orden", now - 30))
        .await
        .unwrap();

    let wrapper = h.wrapper(vec![]);
    let res = wrapper
        .dispatch(in_session(HISTORIAL, "S19").with_body(json!({"query": "errores recientes"})))
        .await;
    let body = &res.body;
    assert_eq!(body["success"], json!(true));
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], json!("error"));
    assert_eq!(body["query_used"]["query"]["filter"]["session_id"], json!("S19"));
}

#[tokio::test]
async fn history_rejects_bad_order_without_failing_the_request() {
    let h = Harness::new(None);
    let wrapper = h.wrapper(vec![]);
    let res = wrapper
        .dispatch(in_session(HISTORIAL, "S20").with_query("order", "sideways"))
        .await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body["success"], json!(false));
    assert!(res.body["error"].as_str().unwrap().starts_with("entrada_invalida"));
}

#[tokio::test]
async fn unknown_tool_is_404() {
    let h = Harness::new(None);
    let res = h.wrapper(vec![]).dispatch(ToolRequest::new("no-existe")).await;
    assert_eq!(res.status, 404);
}
